//! `dlinfo` request validation.
//!
//! Every recognized request is accepted and does nothing: link maps, search
//! paths, origin and TLS introspection are not provided.

use crate::dlfcn::InfoRequest;
use crate::error::DlError;

/// Validate `request`. Codes outside `RTLD_DI_LMID..=RTLD_DI_MAX` fail.
pub fn query_info(request: i32) -> Result<InfoRequest, DlError> {
    InfoRequest::try_from(request).map_err(|request| DlError::UnknownInfoRequest { request })
}
