use crate::fetcher::{apply_gzip, basename, FetchError, FetchedFile, Fetcher};
use async_trait::async_trait;
use glob::Pattern;
use serde::Deserialize;
use serde_json::Value;
use ssh2::{CheckResult, KnownHostFileKind, Session};
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

fn default_port() -> u16 {
    22
}

fn default_pattern() -> String {
    "*".to_string()
}

fn default_retries() -> u32 {
    2
}

fn default_retry_delay_secs() -> u64 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// Connection settings for an SFTP source, deserialized from a log source's
/// connection config.
#[derive(Debug, Clone, Deserialize)]
pub struct SftpConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    pub remote_path: String,
    #[serde(default = "default_pattern")]
    pub pattern: String,
    #[serde(default)]
    pub include_rotated: bool,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Disables host-key verification. Off by default; every connect with
    /// this set logs a warning.
    #[serde(default)]
    pub insecure_skip_host_key: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct RemoteStat {
    pub size: Option<u64>,
    pub is_dir: bool,
}

/// Narrow blocking transport under the SFTP fetcher, so discovery, rotation
/// and retry logic run against an in-memory double in tests.
pub trait SftpTransport: Send {
    fn connect(&mut self, config: &SftpConfig) -> Result<(), FetchError>;
    fn stat(&mut self, path: &str) -> Result<RemoteStat, FetchError>;
    /// Entry names (not full paths) of a remote directory.
    fn list_dir(&mut self, path: &str) -> Result<Vec<String>, FetchError>;
    fn read(&mut self, path: &str) -> Result<Vec<u8>, FetchError>;
    fn close(&mut self);
}

/// SFTP log puller: discovers files (rotated siblings included), downloads
/// them whole and unpacks gzip. Transient transport errors get bounded
/// retries with linearly growing delays.
pub struct SftpFetcher<T: SftpTransport> {
    config: SftpConfig,
    transport: T,
    connected: bool,
}

impl<T: SftpTransport> SftpFetcher<T> {
    pub fn new(config: SftpConfig, transport: T) -> Self {
        Self {
            config,
            transport,
            connected: false,
        }
    }

    pub fn from_connection_config(
        config: &BTreeMap<String, Value>,
        transport: T,
    ) -> Result<Self, FetchError> {
        let value = Value::Object(config.clone().into_iter().collect());
        let config: SftpConfig = serde_json::from_value(value)
            .map_err(|e| FetchError::Config(format!("invalid sftp config: {e}")))?;
        Ok(Self::new(config, transport))
    }

    async fn backoff(&self, attempt: u32) {
        let delay = Duration::from_secs(self.config.retry_delay_secs * (attempt as u64 + 1));
        tokio::time::sleep(delay).await;
    }

    async fn ensure_connected(&mut self) -> Result<(), FetchError> {
        if self.connected {
            return Ok(());
        }
        let mut attempt = 0;
        loop {
            match self.transport.connect(&self.config) {
                Ok(()) => {
                    self.connected = true;
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < self.config.retries => {
                    warn!(host = %self.config.host, attempt, error = %e, "sftp connect failed, retrying");
                    self.backoff(attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn stat_with_retries(&mut self, path: &str) -> Result<RemoteStat, FetchError> {
        let mut attempt = 0;
        loop {
            match self.transport.stat(path) {
                Ok(stat) => return Ok(stat),
                Err(e) if e.is_transient() && attempt < self.config.retries => {
                    warn!(path, attempt, error = %e, "sftp stat failed, retrying");
                    self.backoff(attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn read_with_retries(&mut self, path: &str) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 0;
        loop {
            match self.transport.read(path) {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_transient() && attempt < self.config.retries => {
                    warn!(path, attempt, error = %e, "sftp read failed, retrying");
                    self.backoff(attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn join(dir: &str, entry: &str) -> String {
        if dir == "/" {
            format!("/{entry}")
        } else {
            format!("{}/{entry}", dir.trim_end_matches('/'))
        }
    }

    /// Resolve `remote_path` into the ordered, deduplicated list of files to
    /// download.
    async fn discover(&mut self) -> Result<Vec<String>, FetchError> {
        let remote_path = self.config.remote_path.clone();
        let stat = self.stat_with_retries(&remote_path).await?;

        let mut discovered: Vec<String> = Vec::new();

        if stat.is_dir {
            let entries = self.transport.list_dir(&remote_path)?;
            let pattern = Pattern::new(&self.config.pattern)
                .map_err(|e| FetchError::Config(format!("invalid pattern: {e}")))?;

            for entry in &entries {
                if pattern.matches(entry) {
                    discovered.push(Self::join(&remote_path, entry));
                }
            }

            if self.config.include_rotated {
                let rotated = Pattern::new(&format!("{}.*", self.config.pattern))
                    .map_err(|e| FetchError::Config(format!("invalid pattern: {e}")))?;
                for entry in &entries {
                    if rotated.matches(entry) {
                        discovered.push(Self::join(&remote_path, entry));
                    }
                }
            }
        } else {
            discovered.push(remote_path.clone());

            // Rotation drops siblings like access.log.1 and
            // access.log.2026-01-20.gz next to the live file.
            let (parent, name) = match remote_path.rsplit_once('/') {
                Some(("", name)) => ("/".to_string(), name.to_string()),
                Some((parent, name)) => (parent.to_string(), name.to_string()),
                None => (".".to_string(), remote_path.clone()),
            };
            let siblings = Pattern::new(&format!("{}.*", Pattern::escape(&name)))
                .map_err(|e| FetchError::Config(format!("invalid pattern: {e}")))?;
            let entries = self.transport.list_dir(&parent)?;
            for entry in entries {
                if siblings.matches(&entry) {
                    discovered.push(Self::join(&parent, entry.as_str()));
                }
            }
        }

        let mut seen = HashSet::new();
        discovered.retain(|path| seen.insert(path.clone()));
        Ok(discovered)
    }
}

#[async_trait]
impl<T: SftpTransport + Sync> Fetcher for SftpFetcher<T> {
    async fn test_connection(&mut self) -> (bool, String) {
        if let Err(e) = self.ensure_connected().await {
            return (false, format!("SSH connection failed: {e}"));
        }
        match self.transport.stat(&self.config.remote_path) {
            Ok(_) => (
                true,
                format!(
                    "Successfully connected to {} and found {}",
                    self.config.host, self.config.remote_path
                ),
            ),
            Err(FetchError::NotFound(path)) => (false, format!("Remote path not found: {path}")),
            Err(e) => (false, format!("SSH connection failed: {e}")),
        }
    }

    async fn fetch(&mut self) -> Result<Vec<FetchedFile>, FetchError> {
        self.ensure_connected().await?;
        let paths = self.discover().await?;
        debug!(count = paths.len(), "discovered remote files");

        let mut results = Vec::new();
        for path in paths {
            match self.stat_with_retries(&path).await {
                Ok(_) => {}
                Err(FetchError::NotFound(_)) => {
                    // Rotated away between listing and download.
                    warn!(path, "remote file disappeared, skipping");
                    continue;
                }
                Err(e) => return Err(e),
            }

            let bytes = self.read_with_retries(&path).await?;
            let (name, bytes) = apply_gzip(basename(&path), bytes);
            results.push(FetchedFile {
                name,
                size: bytes.len() as u64,
                bytes,
            });
        }
        Ok(results)
    }

    async fn cleanup(&mut self) {
        if self.connected {
            self.transport.close();
            self.connected = false;
        }
    }
}

/// Production transport speaking SSH/SFTP through libssh2.
#[derive(Default)]
pub struct Ssh2Transport {
    session: Option<Session>,
    sftp: Option<ssh2::Sftp>,
}

impl Ssh2Transport {
    pub fn new() -> Self {
        Self::default()
    }

    fn sftp(&mut self) -> Result<&mut ssh2::Sftp, FetchError> {
        self.sftp
            .as_mut()
            .ok_or_else(|| FetchError::Transport("sftp session not connected".to_string()))
    }
}

fn ssh_err(e: ssh2::Error) -> FetchError {
    // libssh2 SFTP status 2 is "no such file".
    match e.code() {
        ssh2::ErrorCode::SFTP(2) => FetchError::NotFound(e.message().to_string()),
        _ => FetchError::Transport(e.message().to_string()),
    }
}

fn verify_host_key(session: &Session, config: &SftpConfig) -> Result<(), FetchError> {
    let mut known_hosts = session
        .known_hosts()
        .map_err(|e| FetchError::Transport(e.message().to_string()))?;

    let path = dirs::home_dir()
        .map(|home| home.join(".ssh").join("known_hosts"))
        .ok_or_else(|| {
            FetchError::Config(
                "cannot locate known_hosts; set insecure_skip_host_key to opt out".to_string(),
            )
        })?;
    known_hosts
        .read_file(&path, KnownHostFileKind::OpenSSH)
        .map_err(|e| {
            FetchError::Config(format!(
                "cannot read known_hosts at {}: {}",
                path.display(),
                e.message()
            ))
        })?;

    let (key, _key_type) = session
        .host_key()
        .ok_or_else(|| FetchError::Transport("server presented no host key".to_string()))?;

    match known_hosts.check_port(&config.host, config.port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::NotFound => Err(FetchError::Auth(format!(
            "host key for {} not present in known_hosts",
            config.host
        ))),
        CheckResult::Mismatch => Err(FetchError::Auth(format!(
            "host key mismatch for {}",
            config.host
        ))),
        CheckResult::Failure => Err(FetchError::Transport(
            "host key verification failed".to_string(),
        )),
    }
}

impl SftpTransport for Ssh2Transport {
    fn connect(&mut self, config: &SftpConfig) -> Result<(), FetchError> {
        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| FetchError::Transport(format!("resolve {}: {e}", config.host)))?
            .next()
            .ok_or_else(|| {
                FetchError::Transport(format!("no address for {}", config.host))
            })?;

        let tcp = TcpStream::connect_timeout(
            &addr,
            Duration::from_secs(config.connect_timeout_secs),
        )?;

        let mut session =
            Session::new().map_err(|e| FetchError::Transport(e.message().to_string()))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| FetchError::Transport(e.message().to_string()))?;

        if config.insecure_skip_host_key {
            warn!(
                host = %config.host,
                "host-key verification disabled for this source"
            );
        } else {
            verify_host_key(&session, config)?;
        }

        if let Some(password) = config.password.as_deref().filter(|p| !p.is_empty()) {
            session
                .userauth_password(&config.username, password)
                .map_err(|e| FetchError::Auth(e.message().to_string()))?;
        } else if let Some(key) = config.private_key.as_deref().filter(|k| !k.is_empty()) {
            session
                .userauth_pubkey_memory(&config.username, None, key, None)
                .map_err(|e| FetchError::Auth(e.message().to_string()))?;
        } else {
            return Err(FetchError::Config(
                "sftp source needs a password or private_key".to_string(),
            ));
        }

        let sftp = session.sftp().map_err(ssh_err)?;
        self.session = Some(session);
        self.sftp = Some(sftp);
        Ok(())
    }

    fn stat(&mut self, path: &str) -> Result<RemoteStat, FetchError> {
        let stat = self.sftp()?.stat(Path::new(path)).map_err(ssh_err)?;
        Ok(RemoteStat {
            size: stat.size,
            is_dir: stat.is_dir(),
        })
    }

    fn list_dir(&mut self, path: &str) -> Result<Vec<String>, FetchError> {
        let entries = self.sftp()?.readdir(Path::new(path)).map_err(ssh_err)?;
        Ok(entries
            .into_iter()
            .filter_map(|(path, _stat)| {
                path.file_name().map(|n| n.to_string_lossy().into_owned())
            })
            .collect())
    }

    fn read(&mut self, path: &str) -> Result<Vec<u8>, FetchError> {
        let mut file = self.sftp()?.open(Path::new(path)).map_err(ssh_err)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    fn close(&mut self) {
        self.sftp = None;
        self.session = None;
    }
}
