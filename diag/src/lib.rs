#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub use diag_common::*;
pub use diag_router::*;
pub use diag_transport::*;
pub use diag_wire::hdlc;

pub mod config;
