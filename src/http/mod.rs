//! Default [`Transport`] implementation, using `ureq`.


use std::{
    collections::HashMap,
    io::Read,
    net::SocketAddr,
    str::FromStr,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use crate::{
    digest::Digest,
    error::Error,
    manifests::MediaType,
    reference::Repository,
    registry::{ManifestResponse, Transport},
    EventHandler, NoEventHandler,
};

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Host of the API for `docker.io` references.
const DOCKER_HUB_HOST: &str = "registry-1.docker.io";

const DIGEST_HEADER: &str = "Docker-Content-Digest";

/// HTTP client for OCI registries.
///
/// Authentication tokens are requested when a registry responds with a
/// `401` status, and they are reused for later requests to the same
/// repository.
pub struct HttpTransport {
    agent: ureq::Agent,
    tokens: RwLock<HashMap<String, String>>,
    event_handler: Arc<dyn EventHandler>,
}

/// Builder for [`HttpTransport`].
pub struct HttpTransportBuilder {
    connect_timeout: Duration,
    read_timeout: Duration,
    user_agent: String,
    event_handler: Arc<dyn EventHandler>,
}

enum Body<'a> {
    Empty,
    Bytes(&'a [u8]),

    /// Data with its length. It can't be sent twice.
    Stream(&'a mut dyn Read, u64),
}

impl HttpTransport {
    pub fn builder() -> HttpTransportBuilder {
        HttpTransportBuilder {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            user_agent: USER_AGENT.to_owned(),
            event_handler: Arc::new(NoEventHandler),
        }
    }

    /// Base URL for the API of a repository.
    ///
    /// It tries to guess the URI scheme for the registry:
    ///
    /// * If it is a loopback IP (like `127.0.0.1`), or if the port
    ///   is `:80`, it uses `http://`.
    /// * In any other case, it uses `https://`.
    fn base_url(repository: &Repository) -> String {
        format!(
            "{}/v2/{}",
            registry_url(repository.registry()),
            repository.path()
        )
    }

    /// Send a request to the registry.
    ///
    /// If it responds with a `401` error, get the token from the URL in
    /// the `WWW-Authenticate` header, and repeat the request.
    fn send(
        &self,
        repository: &Repository,
        request: ureq::Request,
        mut body: Body<'_>,
    ) -> Result<ureq::Response, Error> {
        self.event_handler
            .registry_request(request.method(), request.url());

        let key = repository.to_string();
        let token = self
            .tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();

        let first = match &token {
            Some(token) => request.clone().set("Authorization", token),
            None => request.clone(),
        };

        let response = match call(first, &mut body) {
            Ok(r) => return Ok(r),
            Err(ureq::Error::Status(401, r)) if !matches!(body, Body::Stream(..)) => r,
            Err(e) => return Err(classify(request.url(), e)),
        };

        // Request a token if the response from the 401 includes the
        // WWW-Authenticate header.
        //
        // The response from the `realm` URL must include either
        // `token` or `access_token`.

        let Some(auth_request) = response
            .header("www-authenticate")
            .and_then(|h| build_auth_request(&self.agent, h))
        else {
            return Err(classify(request.url(), ureq::Error::Status(401, response)));
        };

        self.event_handler.registry_auth(auth_request.url());

        #[derive(serde::Deserialize, Debug)]
        struct Tokens {
            token: Option<String>,
            access_token: Option<String>,
        }

        let auth_url = auth_request.url().to_owned();
        let auth_response = auth_request.call().map_err(|e| classify(&auth_url, e))?;

        let mut token = match serde_json::from_reader(auth_response.into_reader())? {
            Tokens { token: Some(t), .. } => t,
            Tokens {
                access_token: Some(t),
                ..
            } => t,
            _ => return Err(Error::MissingTokens),
        };

        token.insert_str(0, "Bearer ");

        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, token.clone());

        // Repeat the request, now that we have a token.
        let url = request.url().to_owned();
        call(request.set("Authorization", &token), &mut body).map_err(|e| classify(&url, e))
    }
}

impl HttpTransportBuilder {
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Timeout for each read operation in the socket.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn event_handler(mut self, event_handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = event_handler;
        self
    }

    pub fn build(self) -> HttpTransport {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(self.connect_timeout)
            .timeout_read(self.read_timeout)
            .user_agent(&self.user_agent)
            .build();

        HttpTransport {
            agent,
            tokens: Default::default(),
            event_handler: self.event_handler,
        }
    }
}

impl Transport for HttpTransport {
    fn head_manifest(
        &self,
        repository: &Repository,
        reference: &str,
    ) -> Result<Option<Digest>, Error> {
        let url = format!("{}/manifests/{reference}", Self::base_url(repository));
        let request = self
            .agent
            .head(&url)
            .set("Accept", &MediaType::manifest_types());

        let response = self.send(repository, request, Body::Empty)?;
        Ok(response_digest(&response))
    }

    fn get_manifest(
        &self,
        repository: &Repository,
        reference: &str,
        max_size: u64,
    ) -> Result<ManifestResponse, Error> {
        let url = format!("{}/manifests/{reference}", Self::base_url(repository));
        let request = self
            .agent
            .get(&url)
            .set("Accept", &MediaType::manifest_types());

        let response = self.send(repository, request, Body::Empty)?;

        let length = response
            .header("Content-Length")
            .and_then(|l| l.parse::<u64>().ok());

        if length.is_some_and(|l| l > max_size) {
            return Err(Error::ManifestTooLarge(max_size));
        }

        let content_type = response
            .header("Content-Type")
            .and_then(|h| MediaType::from_str(h.split(';').next()?.trim()).ok());

        let digest = response_digest(&response);

        let mut data = Vec::new();
        response
            .into_reader()
            .take(max_size + 1)
            .read_to_end(&mut data)
            .map_err(|e| transient(&url, e))?;

        if data.len() as u64 > max_size {
            return Err(Error::ManifestTooLarge(max_size));
        }

        Ok(ManifestResponse {
            content_type,
            digest,
            data,
        })
    }

    fn put_manifest(
        &self,
        repository: &Repository,
        reference: &str,
        media_type: MediaType,
        data: &[u8],
    ) -> Result<Option<Digest>, Error> {
        let url = format!("{}/manifests/{reference}", Self::base_url(repository));
        let request = self
            .agent
            .put(&url)
            .set("Content-Type", media_type.as_str());

        let response = self.send(repository, request, Body::Bytes(data))?;
        Ok(response_digest(&response))
    }

    fn get_blob(
        &self,
        repository: &Repository,
        digest: &Digest,
    ) -> Result<Box<dyn Read + Send>, Error> {
        let url = format!("{}/blobs/{digest}", Self::base_url(repository));
        let response = self.send(repository, self.agent.get(&url), Body::Empty)?;
        Ok(Box::new(response.into_reader()))
    }

    fn has_blob(&self, repository: &Repository, digest: &Digest) -> Result<bool, Error> {
        let url = format!("{}/blobs/{digest}", Self::base_url(repository));
        match self.send(repository, self.agent.head(&url), Body::Empty) {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn put_blob(
        &self,
        repository: &Repository,
        digest: &Digest,
        size: u64,
        data: &mut dyn Read,
    ) -> Result<(), Error> {
        let url = format!("{}/blobs/uploads/", Self::base_url(repository));
        let response = self.send(repository, self.agent.post(&url), Body::Empty)?;

        let location = match response.header("Location") {
            Some(l) if l.starts_with('/') => {
                format!("{}{l}", registry_url(repository.registry()))
            }

            Some(l) => l.to_owned(),

            None => {
                return Err(Error::TransientTransport {
                    url,
                    message: "missing Location header in upload response".into(),
                })
            }
        };

        let request = self
            .agent
            .put(&location)
            .query("digest", digest.source())
            .set("Content-Type", "application/octet-stream");

        self.send(repository, request, Body::Stream(data, size))?;

        Ok(())
    }
}

fn call(request: ureq::Request, body: &mut Body<'_>) -> Result<ureq::Response, ureq::Error> {
    match body {
        Body::Empty => request.call(),
        Body::Bytes(data) => request.send_bytes(*data),
        Body::Stream(reader, length) => request
            .set("Content-Length", &length.to_string())
            .send(reader),
    }
}

/// Convert a `ureq` error to [`Error::NotFound`] or
/// [`Error::TransientTransport`] when possible.
fn classify(url: &str, error: ureq::Error) -> Error {
    use ureq::ErrorKind;

    match error {
        ureq::Error::Status(404, _) => Error::NotFound(url.to_owned()),

        ureq::Error::Status(status @ (429 | 502 | 503 | 504), _) => Error::TransientTransport {
            url: url.to_owned(),
            message: format!("HTTP status {status}"),
        },

        ureq::Error::Transport(t)
            if matches!(
                t.kind(),
                ErrorKind::Dns | ErrorKind::ConnectionFailed | ErrorKind::Io
            ) =>
        {
            Error::TransientTransport {
                url: url.to_owned(),
                message: t.to_string(),
            }
        }

        e => Error::from(e),
    }
}

/// I/O errors while reading a response body are retryable.
pub(crate) fn transient(url: &str, error: std::io::Error) -> Error {
    Error::TransientTransport {
        url: url.to_owned(),
        message: error.to_string(),
    }
}

fn response_digest(response: &ureq::Response) -> Option<Digest> {
    let header = response.header(DIGEST_HEADER)?;
    match Digest::from_str(header.trim()) {
        Ok(d) => Some(d),
        Err(e) => {
            log::warn!("ignore invalid {DIGEST_HEADER} header {header:?}: {e}");
            None
        }
    }
}

/// Scheme and host for the API of a registry.
fn registry_url(registry: &str) -> String {
    let host = match registry {
        crate::reference::DEFAULT_REGISTRY => DOCKER_HUB_HOST,
        r => r,
    };

    format!("{}{host}", guess_scheme(host))
}

fn guess_scheme(registry: &str) -> &'static str {
    const HTTP: &str = "http://";
    const HTTPS: &str = "https://";

    if registry.ends_with(":80") || registry == "localhost" || registry.starts_with("localhost:") {
        return HTTP;
    }

    if let Ok(address) = SocketAddr::from_str(registry) {
        let loopback = match address {
            SocketAddr::V4(v4) => v4.ip().is_loopback(),
            SocketAddr::V6(v6) => v6.ip().is_loopback(),
        };

        return if loopback { HTTP } else { HTTPS };
    }

    HTTPS
}

/// Parse a `WWW-Authenticate` header and build the request to
/// get the authentication token.
///
/// Return `None` if the header can't be parsed.
///
/// See <https://distribution.github.io/distribution/spec/auth/token/>
/// for more details.
fn build_auth_request(agent: &ureq::Agent, auth_spec: &str) -> Option<ureq::Request> {
    let mut request = None;
    let mut pending_params = vec![];
    let mut tail = auth_spec;

    // The first token must be `Bearer`
    tail = tail.strip_prefix("Bearer ")?;

    loop {
        let (key, value) = tail.split_once('=')?;
        let key = key.trim_ascii();
        let (value, after) = value.strip_prefix('"')?.split_once('"')?;

        if key == "realm" {
            request = Some(
                pending_params
                    .drain(..)
                    .fold(agent.get(value), |r, (k, v)| r.query(k, v)),
            );
        } else {
            match request.take() {
                Some(r) => request = Some(r.query(key, value)),
                None => pending_params.push((key, value)),
            }
        }

        tail = match after.trim_ascii_start() {
            "" => return request,
            t => t.strip_prefix(',')?,
        };
    }
}
