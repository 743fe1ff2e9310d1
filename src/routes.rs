//! Static route table for the transfer API.
//!
//! Every endpoint the client talks to is declared here once, as a symbolic
//! key mapped to method, path suffix and whether the route requires a
//! signed session. The table is resolved against the configured base URL
//! at startup and is immutable for the process lifetime.

use reqwest::Method;
use url::Url;

use crate::error::{Result, XferError};

/// Symbolic keys for every API route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteKey {
    RegistrationInit,
    RegistrationFinal,
    OpenConfig,
    OpenInit,
    OpenFinish,

    UploadInit,
    UploadPart,
    UploadComplete,

    FileList,

    DownloadInit,
    DownloadData,
    DownloadMeta,
    DownloadDigest,

    DeleteFile,

    TestUpload,
    TestDownload,
}

/// Query parameter names used by the API.
pub mod query {
    pub const UPLOAD_ID: &str = "upload_id";
    pub const CHUNK_ID: &str = "chunk_id";
    pub const FILE_ID: &str = "file_id";
}

/// Header names used by the API.
pub mod header {
    pub const TIMESTAMP: &str = "X-Timestamp";
    pub const SESSION_ID: &str = "X-Session-ID";
    pub const REQ_SIGNATURE: &str = "X-Req-Signature";
    pub const BODY_SIGNATURE: &str = "X-Body-Signature";
    pub const DOWNLOAD_ID: &str = "X-Download-ID";
    pub const START_TIME: &str = "Start-Time";
}

/// Content types attached to request bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Json,
    Octet,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Octet => "application/octet-stream",
        }
    }
}

/// A single resolved route.
#[derive(Debug, Clone)]
pub struct Route {
    /// HTTP method.
    pub method: Method,
    /// Fully resolved URL (base + path suffix).
    pub url: Url,
    /// Whether the route requires a signed session.
    pub auth: bool,
}

/// Declaration of a route before resolution.
struct RouteDecl {
    key: RouteKey,
    method: Method,
    path: &'static str,
    auth: bool,
}

/// The full route declaration table.
fn declarations() -> Vec<RouteDecl> {
    use RouteKey::*;
    vec![
        RouteDecl { key: RegistrationInit, method: Method::POST, path: "public/bucket/create/s1", auth: false },
        RouteDecl { key: RegistrationFinal, method: Method::POST, path: "public/bucket/create/s2", auth: false },
        RouteDecl { key: OpenConfig, method: Method::GET, path: "public/bucket/open/config", auth: false },
        RouteDecl { key: OpenInit, method: Method::POST, path: "public/bucket/open/s1", auth: false },
        RouteDecl { key: OpenFinish, method: Method::POST, path: "public/bucket/open/s2", auth: false },

        RouteDecl { key: UploadInit, method: Method::POST, path: "private/file/upload/init", auth: true },
        RouteDecl { key: UploadPart, method: Method::POST, path: "private/file/upload/part", auth: true },
        RouteDecl { key: UploadComplete, method: Method::POST, path: "private/file/upload/complete", auth: true },

        RouteDecl { key: FileList, method: Method::GET, path: "private/file/list", auth: true },

        RouteDecl { key: DownloadInit, method: Method::GET, path: "private/file/download/init", auth: true },
        RouteDecl { key: DownloadData, method: Method::GET, path: "private/file/download/data", auth: true },
        RouteDecl { key: DownloadMeta, method: Method::GET, path: "private/file/download/meta", auth: true },
        RouteDecl { key: DownloadDigest, method: Method::GET, path: "private/file/download/digest", auth: true },

        RouteDecl { key: DeleteFile, method: Method::DELETE, path: "private/file/delete", auth: true },

        RouteDecl { key: TestUpload, method: Method::POST, path: "public/test/upload", auth: false },
        RouteDecl { key: TestDownload, method: Method::GET, path: "public/test/download", auth: false },
    ]
}

/// Route table resolved against a base URL.
///
/// Built once at startup; lookups never fail for declared keys.
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: std::collections::HashMap<RouteKey, Route>,
}

impl RouteTable {
    /// Resolves the declaration table against `base_url`.
    ///
    /// A base URL without a trailing slash gets one, so that relative
    /// path suffixes append rather than replace the last segment.
    pub fn new(base_url: &str) -> Result<Self> {
        let mut base = base_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = Url::parse(&base)
            .map_err(|e| XferError::Internal(format!("invalid base URL {}: {}", base_url, e)))?;

        let mut routes = std::collections::HashMap::new();
        for decl in declarations() {
            let url = base
                .join(decl.path)
                .map_err(|e| XferError::Internal(format!("failed to resolve {}: {}", decl.path, e)))?;
            routes.insert(
                decl.key,
                Route {
                    method: decl.method,
                    url,
                    auth: decl.auth,
                },
            );
        }

        Ok(Self { routes })
    }

    /// Looks up a route by key.
    pub fn get(&self, key: RouteKey) -> &Route {
        // Every key is declared in declarations(); a miss is a programmer error.
        self.routes.get(&key).expect("route key not registered")
    }
}
