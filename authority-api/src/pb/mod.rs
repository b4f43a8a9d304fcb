//! Generated protobuf bindings for the delegated authority API.
//!
//! **This module contains generated code. Do not edit these files manually.**
//!
//! ## Lint Suppressions
//!
//! The following lint suppressions are applied to this module because the generated code
//! from `prost`/`tonic-build` does not always conform to our linting standards:
//!
//! - `clippy::all` and `clippy::pedantic`: Generated code may not follow all clippy rules
//! - `missing_docs`: Generated types may lack documentation
//!
//! These suppressions are intentional and scoped to this generated code module only.
#![allow(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(missing_docs)]

pub mod authority {
    pub mod delegated {
        pub mod v1 {
            tonic::include_proto!("authority.delegated.v1");
        }
    }
}
