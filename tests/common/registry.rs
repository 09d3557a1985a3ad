use std::{
    collections::HashMap,
    io::Read,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use oci_depot::{Digest, MediaType};
use tiny_http::{Header, Method, Request, Response, Server};

use super::blobs::{self, Blob};

/// Registry server, listening in a random port.
///
/// Content is kept in memory, and it is shared with the instance returned
/// by [`start_registry`].
pub struct Registry {
    port: u16,
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    /// Manifests, by repository path and reference (tag or digest).
    manifests: HashMap<(String, String), (MediaType, Vec<u8>)>,

    blobs: HashMap<Digest, Vec<u8>>,

    /// Data sent instead of the real content of a blob.
    tampered: HashMap<Digest, Vec<u8>>,

    /// Number of blob downloads to reject with a `503` status.
    unavailable: u32,

    next_upload: u32,

    requests: Vec<String>,
}

/// Start a registry server in a random port.
pub fn start_registry() -> Registry {
    let server = Server::http("127.0.0.1:0").expect("start registry server");
    let port = server.server_addr().to_ip().unwrap().port();

    let state = Arc::new(Mutex::new(State::default()));

    let handler = Handler {
        server,
        state: Arc::clone(&state),
    };

    std::thread::spawn(move || handler.run());

    Registry { port, state }
}

impl Registry {
    /// Address to use in references.
    pub fn host(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Add an image to the repository in `path`. Returns the digest of its
    /// manifest.
    pub fn add_image(&self, path: &str, tag: &str, config: &Blob, layers: &[Blob]) -> Digest {
        let manifest = blobs::manifest(config, layers);
        let digest = Digest::sha256(&manifest);

        let mut state = self.state();
        for blob in std::iter::once(config).chain(layers) {
            state.blobs.insert(blob.digest.clone(), blob.data.clone());
        }

        for reference in [tag.to_owned(), digest.to_string()] {
            state.manifests.insert(
                (path.to_owned(), reference),
                (MediaType::OciManifestV1, manifest.clone()),
            );
        }

        digest
    }

    /// Send `data` when the blob is requested.
    pub fn tamper(&self, digest: &Digest, data: &[u8]) {
        self.state().tampered.insert(digest.clone(), data.to_vec());
    }

    /// Reject the next `count` blob downloads.
    pub fn set_unavailable(&self, count: u32) {
        self.state().unavailable = count;
    }

    pub fn has_blob(&self, digest: &Digest) -> bool {
        self.state().blobs.contains_key(digest)
    }

    pub fn manifest(&self, path: &str, reference: &str) -> Option<Vec<u8>> {
        self.state()
            .manifests
            .get(&(path.to_owned(), reference.to_owned()))
            .map(|(_, data)| data.clone())
    }

    /// Number of requests that start with `prefix`, like `"GET /v2/"`.
    pub fn requests(&self, prefix: &str) -> usize {
        self.state()
            .requests
            .iter()
            .filter(|r| r.starts_with(prefix))
            .count()
    }
}

struct Handler {
    server: Server,
    state: Arc<Mutex<State>>,
}

impl Handler {
    fn run(self) {
        let timeout = Duration::from_secs(30);

        while let Ok(Some(request)) = self.server.recv_timeout(timeout) {
            self.handle(request);
        }
    }

    fn handle(&self, mut request: Request) {
        let method = request.method().clone();
        let url = request.url().to_owned();

        let mut state = self.state.lock().unwrap();
        state.requests.push(format!("{method} {url}"));

        let (path, query) = url.split_once('?').unwrap_or((&url, ""));

        let Some(path) = path.strip_prefix("/v2/") else {
            return respond(request, 404, Vec::new(), &[]);
        };

        if let Some((repository, reference)) = path.split_once("/manifests/") {
            let key = (repository.to_owned(), reference.to_owned());

            match method {
                Method::Get | Method::Head => match state.manifests.get(&key) {
                    Some((media_type, data)) => {
                        let digest = Digest::sha256(data).to_string();
                        let headers = [
                            ("Content-Type", media_type.as_str()),
                            ("Docker-Content-Digest", digest.as_str()),
                        ];

                        respond(request, 200, data.clone(), &headers);
                    }

                    None => respond(request, 404, Vec::new(), &[]),
                },

                Method::Put => {
                    let media_type = request
                        .headers()
                        .iter()
                        .find(|h| h.field.equiv("Content-Type"))
                        .and_then(|h| MediaType::from_str(h.value.as_str()).ok())
                        .unwrap_or(MediaType::OciManifestV1);

                    let mut data = Vec::new();
                    request.as_reader().read_to_end(&mut data).unwrap();

                    let digest = Digest::sha256(&data);
                    for reference in [reference.to_owned(), digest.to_string()] {
                        state.manifests.insert(
                            (repository.to_owned(), reference),
                            (media_type, data.clone()),
                        );
                    }

                    let digest = digest.to_string();
                    respond(
                        request,
                        201,
                        Vec::new(),
                        &[("Docker-Content-Digest", &digest)],
                    );
                }

                _ => respond(request, 405, Vec::new(), &[]),
            }

            return;
        }

        if let Some((repository, upload)) = path.split_once("/blobs/uploads/") {
            match method {
                Method::Post => {
                    state.next_upload += 1;
                    let location = format!("/v2/{repository}/blobs/uploads/{}", state.next_upload);
                    respond(request, 202, Vec::new(), &[("Location", &location)]);
                }

                Method::Put if !upload.is_empty() => {
                    let digest = url::form_urlencoded::parse(query.as_bytes())
                        .find(|(k, _)| k == "digest")
                        .and_then(|(_, v)| Digest::from_str(&v).ok());

                    let mut data = Vec::new();
                    request.as_reader().read_to_end(&mut data).unwrap();

                    match digest {
                        Some(digest) if digest.verify(&data).is_ok() => {
                            state.blobs.insert(digest, data);
                            respond(request, 201, Vec::new(), &[]);
                        }

                        _ => respond(request, 400, Vec::new(), &[]),
                    }
                }

                _ => respond(request, 405, Vec::new(), &[]),
            }

            return;
        }

        if let Some((_, digest)) = path.split_once("/blobs/") {
            let Ok(digest) = Digest::from_str(digest) else {
                return respond(request, 400, Vec::new(), &[]);
            };

            if method == Method::Get && state.unavailable > 0 {
                state.unavailable -= 1;
                return respond(request, 503, Vec::new(), &[]);
            }

            let data = state
                .tampered
                .get(&digest)
                .or_else(|| state.blobs.get(&digest))
                .cloned();

            match data {
                Some(data) => respond(request, 200, data, &[]),
                None => respond(request, 404, Vec::new(), &[]),
            }

            return;
        }

        respond(request, 404, Vec::new(), &[]);
    }
}

fn respond(request: Request, status: u16, body: Vec<u8>, headers: &[(&str, &str)]) {
    let mut response = Response::from_data(body).with_status_code(status);

    for (name, value) in headers {
        response.add_header(Header::from_bytes(*name, *value).unwrap());
    }

    request.respond(response).expect("Send response");
}
