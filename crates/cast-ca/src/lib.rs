//! cast-ca: the agent's certificate authority.
//!
//! Peers submit certificate signing requests by name; an operator signs
//! them with the CA key generated on first start.

pub mod ca;
pub mod certgen;
pub mod error;

pub use ca::{CA_MANAGER, CaLayout, CaManager, REQUEST_TYPE, RequestInfo, RequestJob, SigningRequest};
pub use certgen::{CaFiles, CertGenerator, OpensslCertGenerator};
pub use error::{CaError, CaResult};
