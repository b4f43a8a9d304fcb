//! Generated protobuf bindings for the forwarded demonstration service.
//!
//! **This module contains generated code. Do not edit these files manually.**
//!
//! Lint suppressions are intentional and scoped to this generated code module only.
#![allow(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(missing_docs)]

pub mod proxy {
    pub mod hello {
        pub mod v1 {
            tonic::include_proto!("proxy.hello.v1");
        }
    }
}
