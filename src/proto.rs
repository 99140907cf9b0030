//! Generated TensorFlow-Serving wire types.
//!
//! Module nesting mirrors the proto package hierarchy so cross-package
//! references resolve (`tensorflow.serving` types refer to `tensorflow`
//! tensor types via `super::`).

pub mod tensorflow {
    tonic::include_proto!("tensorflow");

    pub mod serving {
        tonic::include_proto!("tensorflow.serving");
    }
}

pub use tensorflow::serving;
