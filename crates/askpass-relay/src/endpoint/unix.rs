use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use askpass_relay_core::InvocationId;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use super::ENDPOINT_PREFIX;
use crate::error::EndpointError;

/// A single accepted helper connection.
pub type Connection = UnixStream;

/// Directory endpoints are created in when none is configured.
///
/// `$XDG_RUNTIME_DIR` if set, the system temp directory otherwise. Both are
/// fine since the per-invocation directory itself is private.
pub fn default_base_dir() -> PathBuf {
    dirs::runtime_dir().unwrap_or_else(std::env::temp_dir)
}

/// Owner of an invocation's socket and its private directory.
#[derive(Debug)]
pub struct RelayEndpoint {
    address: String,
    dir: PathBuf,
    released: bool,
}

impl RelayEndpoint {
    /// Address exported to the helper through the environment.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Remove the socket and its directory. Safe to call more than once.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Err(e) = std::fs::remove_file(&self.address) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.address, error = %e, "Failed to remove relay socket");
            }
        }
        if let Err(e) = std::fs::remove_dir(&self.dir) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.dir.display(), error = %e, "Failed to remove endpoint directory");
            }
        }
        debug!(path = %self.address, "Released relay endpoint");
    }
}

impl Drop for RelayEndpoint {
    fn drop(&mut self) {
        self.release();
    }
}

/// Accepts helper connections for one invocation.
#[derive(Debug)]
pub struct EndpointListener {
    inner: UnixListener,
}

impl EndpointListener {
    /// Wait for the next helper connection.
    pub async fn accept(&mut self) -> io::Result<Connection> {
        let (stream, _addr) = self.inner.accept().await?;
        Ok(stream)
    }
}

/// Create the endpoint for `id` under `base` (or [`default_base_dir`]).
///
/// Fails if the invocation directory already exists, so two invocations can
/// never end up on the same socket. Must be called from within a Tokio
/// runtime.
pub fn bind(
    id: &InvocationId,
    base: Option<&Path>,
) -> Result<(RelayEndpoint, EndpointListener), EndpointError> {
    let base = base.map(Path::to_path_buf).unwrap_or_else(default_base_dir);
    std::fs::create_dir_all(&base).map_err(EndpointError::DirectoryCreationFailed)?;

    let dir = base.join(format!("{ENDPOINT_PREFIX}{id}"));
    let path = dir.join("socket");
    let address = path
        .to_str()
        .ok_or_else(|| EndpointError::InvalidPath(path.display().to_string()))?
        .to_string();

    DirBuilder::new()
        .mode(0o700)
        .create(&dir)
        .map_err(EndpointError::DirectoryCreationFailed)?;

    // From here on the endpoint owns the directory and cleans it up on
    // any early return.
    let endpoint = RelayEndpoint {
        address,
        dir,
        released: false,
    };

    let listener = UnixListener::bind(&path).map_err(EndpointError::BindFailed)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).map_err(|e| {
        EndpointError::BindFailed(io::Error::other(format!(
            "Failed to set socket permissions: {}",
            e
        )))
    })?;

    debug!(path = %endpoint.address, "Relay endpoint bound");
    Ok((endpoint, EndpointListener { inner: listener }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode(path: &Path) -> u32 {
        std::fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[tokio::test]
    async fn bind_creates_private_socket() {
        let temp_dir = tempfile::tempdir().unwrap();
        let id = InvocationId::generate();

        let (endpoint, _listener) = bind(&id, Some(temp_dir.path())).unwrap();
        let socket = Path::new(endpoint.address());

        assert!(socket.exists());
        assert!(endpoint.address().contains(id.as_str()));
        assert_eq!(mode(socket), 0o600);
        assert_eq!(mode(socket.parent().unwrap()), 0o700);
    }

    #[tokio::test]
    async fn bind_creates_missing_base_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        let base = temp_dir.path().join("nested").join("runtime");

        let (endpoint, _listener) = bind(&InvocationId::generate(), Some(&base)).unwrap();
        assert!(endpoint.address().starts_with(base.to_str().unwrap()));
    }

    #[tokio::test]
    async fn concurrent_endpoints_are_distinct() {
        let temp_dir = tempfile::tempdir().unwrap();

        let (a, _la) = bind(&InvocationId::generate(), Some(temp_dir.path())).unwrap();
        let (b, _lb) = bind(&InvocationId::generate(), Some(temp_dir.path())).unwrap();

        assert_ne!(a.address(), b.address());
    }

    #[tokio::test]
    async fn existing_directory_is_not_reused() {
        let temp_dir = tempfile::tempdir().unwrap();
        let id = InvocationId::generate();

        let (_endpoint, _listener) = bind(&id, Some(temp_dir.path())).unwrap();
        let result = bind(&id, Some(temp_dir.path()));

        assert!(matches!(
            result,
            Err(EndpointError::DirectoryCreationFailed(_))
        ));
    }

    #[tokio::test]
    async fn release_removes_socket_and_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (mut endpoint, listener) = bind(&InvocationId::generate(), Some(temp_dir.path())).unwrap();
        let socket = PathBuf::from(endpoint.address());
        let dir = socket.parent().unwrap().to_path_buf();

        drop(listener);
        endpoint.release();
        assert!(!socket.exists());
        assert!(!dir.exists());

        // Second release is a no-op.
        endpoint.release();
    }

    #[tokio::test]
    async fn drop_releases_endpoint() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (endpoint, _listener) = bind(&InvocationId::generate(), Some(temp_dir.path())).unwrap();
        let dir = Path::new(endpoint.address()).parent().unwrap().to_path_buf();

        drop(endpoint);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn accept_yields_connections() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (endpoint, mut listener) = bind(&InvocationId::generate(), Some(temp_dir.path())).unwrap();

        let address = endpoint.address().to_string();
        let connect = tokio::spawn(async move { UnixStream::connect(address).await });

        listener.accept().await.unwrap();
        connect.await.unwrap().unwrap();
    }
}
