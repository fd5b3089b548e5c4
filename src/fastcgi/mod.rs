//! FastCGI responder：在继承自 fd 0 的监听 socket 上提供同一套路由。

mod conn;
mod record;

use axum::Router;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tracing::{debug, info, warn};

pub use conn::serve_connection;

/// FastCGI 规范中 Web 服务器传入监听 socket 的文件描述符。
pub const FCGI_LISTENSOCK_FILENO: i32 = 0;

#[derive(Debug, Error)]
pub enum FcgiError {
    #[error("fastcgi i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("unsupported fastcgi protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("malformed {0} record")]
    MalformedRecord(&'static str),
    #[error("malformed name-value pairs")]
    MalformedParams,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    /// 接管 fd 0 上的监听 socket（TCP 或 Unix domain）。
    #[cfg(unix)]
    pub fn from_stdin() -> io::Result<Self> {
        use std::os::fd::{FromRawFd, IntoRawFd};

        // SAFETY: fd 0 stays open for the life of the process and is wrapped by
        // exactly one listener; the probe below hands it back without closing.
        let tcp = unsafe { std::net::TcpListener::from_raw_fd(FCGI_LISTENSOCK_FILENO) };
        if tcp.local_addr().is_ok() {
            tcp.set_nonblocking(true)?;
            return Ok(Listener::Tcp(TcpListener::from_std(tcp)?));
        }

        let fd = tcp.into_raw_fd();
        // SAFETY: same descriptor, ownership moved out of the TCP probe above.
        let unix = unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd) };
        match unix.local_addr() {
            Ok(_) => {
                unix.set_nonblocking(true)?;
                Ok(Listener::Unix(UnixListener::from_std(unix)?))
            }
            Err(err) => {
                let _ = unix.into_raw_fd();
                Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("stdin is not a listening socket: {err}"),
                ))
            }
        }
    }

    #[cfg(not(unix))]
    pub fn from_stdin() -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "fcgi mode requires a unix platform",
        ))
    }
}

/// 接受连接并为每个连接启动独立任务，直到监听 socket 出错。
pub async fn serve(listener: Listener, router: Router) -> io::Result<()> {
    info!("serving FastCGI on inherited socket");
    loop {
        match &listener {
            Listener::Tcp(listener) => match listener.accept().await {
                Ok((stream, peer)) => spawn_connection(stream, router.clone(), peer.to_string()),
                Err(err) => warn!(error = %err, "fastcgi accept failed"),
            },
            #[cfg(unix)]
            Listener::Unix(listener) => match listener.accept().await {
                Ok((stream, _)) => spawn_connection(stream, router.clone(), "unix".to_string()),
                Err(err) => warn!(error = %err, "fastcgi accept failed"),
            },
        }
    }
}

fn spawn_connection<S>(stream: S, router: Router, peer: String)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        debug!(peer, "fastcgi connection accepted");
        if let Err(err) = serve_connection(stream, router).await {
            warn!(peer, error = %err, "fastcgi connection closed with error");
        }
    });
}
