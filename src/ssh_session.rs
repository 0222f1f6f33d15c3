//! SSH client + cached SFTP sub-session, dialed over the WebSocket tunnel
//! (spec §4.3).
//!
//! Authentication is fixed: username `agent`, password equal to the
//! configured auth token (or empty). Host-key verification is disabled —
//! the WebSocket handshake already authenticated the peer. Grounded on the
//! `russh`/`russh-sftp` pairing used by the closest sibling example
//! (`other_examples/aitechnerd-sshore`) for dialing SSH over a
//! non-TCP transport.

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::ChannelMsg;
use russh_sftp::protocol::OpenFlags;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::tunnel::WsTunnel;

pub struct SftpFileStat {
    pub is_file: bool,
    pub is_dir: bool,
    pub size: u64,
    pub modified: u64,
}

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub auth_token: Option<String>,
    pub keepalive_interval: Duration,
    pub keepalive_max_missed: u32,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            auth_token: None,
            keepalive_interval: Duration::from_secs(15),
            keepalive_max_missed: 3,
        }
    }
}

pub struct ExecOutput {
    pub returncode: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

fn io_to_sftp_error(e: russh::Error) -> russh_sftp::client::error::Error {
    russh_sftp::client::error::Error::UnexpectedBehavior(e.to_string())
}

/// Host-key verification is disabled by design (spec §4.3).
struct AcceptAllKeys;

#[async_trait::async_trait]
impl client::Handler for AcceptAllKeys {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// An SSH client connection plus a lazily-created, cached SFTP sub-session.
pub struct SshSession {
    handle: Handle<AcceptAllKeys>,
    sftp: tokio::sync::Mutex<Option<Arc<russh_sftp::client::SftpSession>>>,
    tunnel: std::sync::Mutex<Option<WsTunnel>>,
}

impl SshSession {
    /// Open an SSH client over `stream` (the WsTunnel's duplex endpoint).
    pub async fn connect<S>(stream: S, config: &SshConfig, tunnel: WsTunnel) -> Result<Self, russh::Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let russh_config = Arc::new(russh::client::Config {
            keepalive_interval: Some(config.keepalive_interval),
            keepalive_max: config.keepalive_max_missed as usize,
            ..Default::default()
        });

        let mut handle =
            client::connect_stream(russh_config, stream, AcceptAllKeys).await?;

        let password = config.auth_token.clone().unwrap_or_default();
        let auth = handle.authenticate_password("agent", password).await?;
        if !auth.success() {
            return Err(russh::Error::NotAuthenticated);
        }

        Ok(Self {
            handle,
            sftp: tokio::sync::Mutex::new(None),
            tunnel: std::sync::Mutex::new(Some(tunnel)),
        })
    }

    /// Execute a single command on the remote shell. Never raises on
    /// non-zero exit — the caller classifies the result.
    pub async fn run(&self, command: &str) -> Result<ExecOutput, russh::Error> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut code = 0i32;

        loop {
            let Some(msg) = channel.wait().await else { break };
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => code = exit_status as i32,
                ChannelMsg::Eof | ChannelMsg::Close => break,
                _ => {}
            }
        }

        Ok(ExecOutput { returncode: code, stdout, stderr })
    }

    /// Return the cached SFTP sub-session, lazily creating it on first call.
    pub async fn get_sftp(&self) -> Result<Arc<russh_sftp::client::SftpSession>, russh::Error> {
        let mut guard = self.sftp.lock().await;
        if let Some(existing) = guard.as_ref() {
            return Ok(existing.clone());
        }

        let channel = self.handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = russh_sftp::client::SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| russh::Error::IO(std::io::Error::other(e.to_string())))?;
        let sftp = Arc::new(sftp);
        *guard = Some(sftp.clone());
        Ok(sftp)
    }

    /// Read an entire remote file via SFTP.
    pub async fn sftp_read(&self, path: &str) -> Result<Vec<u8>, russh_sftp::client::error::Error> {
        let sftp = self.get_sftp().await.map_err(io_to_sftp_error)?;
        let mut file = sftp.open(path).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.map_err(|e| {
            russh_sftp::client::error::Error::UnexpectedBehavior(e.to_string())
        })?;
        Ok(buf)
    }

    /// Write (creating or truncating) an entire remote file via SFTP.
    pub async fn sftp_write(&self, path: &str, data: &[u8]) -> Result<(), russh_sftp::client::error::Error> {
        let sftp = self.get_sftp().await.map_err(io_to_sftp_error)?;
        let mut file = sftp
            .open_with_flags(
                path,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await?;
        file.write_all(data).await.map_err(|e| {
            russh_sftp::client::error::Error::UnexpectedBehavior(e.to_string())
        })?;
        Ok(())
    }

    /// Create a single directory level (non-recursive).
    pub async fn sftp_mkdir(&self, path: &str) -> Result<(), russh_sftp::client::error::Error> {
        let sftp = self.get_sftp().await.map_err(io_to_sftp_error)?;
        sftp.create_dir(path).await
    }

    /// Create every missing directory level along `path`, ignoring
    /// already-exists failures for intermediate segments.
    pub async fn sftp_mkdir_all(&self, path: &str) -> Result<(), russh_sftp::client::error::Error> {
        let sftp = self.get_sftp().await.map_err(io_to_sftp_error)?;
        let mut built = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if !built.is_empty() {
                built.push('/');
            }
            built.push_str(segment);
            let _ = sftp.create_dir(&built).await;
        }
        Ok(())
    }

    pub async fn sftp_rename(&self, old: &str, new: &str) -> Result<(), russh_sftp::client::error::Error> {
        let sftp = self.get_sftp().await.map_err(io_to_sftp_error)?;
        sftp.rename(old, new).await
    }

    pub async fn sftp_read_dir(&self, path: &str) -> Result<Vec<String>, russh_sftp::client::error::Error> {
        let sftp = self.get_sftp().await.map_err(io_to_sftp_error)?;
        let entries = sftp.read_dir(path).await?;
        Ok(entries
            .into_iter()
            .map(|e| e.file_name())
            .filter(|n| n != "." && n != "..")
            .collect())
    }

    pub async fn sftp_metadata(&self, path: &str) -> Result<SftpFileStat, russh_sftp::client::error::Error> {
        let sftp = self.get_sftp().await.map_err(io_to_sftp_error)?;
        let meta = sftp.metadata(path).await?;
        Ok(SftpFileStat {
            is_file: meta.file_type().is_file(),
            is_dir: meta.file_type().is_dir(),
            size: meta.size.unwrap_or(0),
            modified: meta.mtime.unwrap_or(0) as u64,
        })
    }

    /// Close SFTP (if any), then SSH, then the underlying WebSocket.
    /// Idempotent.
    pub async fn close(&self) {
        if let Some(sftp) = self.sftp.lock().await.take() {
            if let Ok(sftp) = Arc::try_unwrap(sftp) {
                let _ = sftp.close().await;
            }
        }
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
        if let Some(tunnel) = self.tunnel.lock().unwrap().take() {
            tunnel.close();
        }
    }
}
