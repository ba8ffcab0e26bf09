//! **The Gantry Prelude**
//!
//! The purpose of this module is to *simplify*, *make module dependencies
//! obvious*, and *keep consistency* across the crate. It re-exports the
//! commonly used external types and the crate's own modules.

// External commonly used dependencies
pub use bytes::{Bytes, BytesMut};
pub use dashmap::DashMap;
pub use http::{
    self, header, uri, HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode,
    Uri, Version,
};
pub use log::{debug, error, info, trace, warn};
pub use std::collections::HashMap;
pub use std::fmt::{self, Debug, Display, Formatter};
pub use std::io;
pub use std::path::{Path, PathBuf};
pub use std::str;
pub use std::sync::Arc;
pub use tokio::io::{AsyncRead, AsyncWrite};

// Modules
pub use crate::application;
pub use crate::cache;
pub use crate::dispatch;
pub use crate::encryption;
pub use crate::hooks;
pub use crate::host;
pub use crate::lists;
pub use crate::loader;
pub use crate::reply;
pub use crate::utility;

// Crate types
pub use crate::reply::{Descriptor, Payload};
pub use crate::Server;
