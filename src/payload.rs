use indexmap::IndexSet;
use once_cell::sync::Lazy;
use regex::Regex;
use rocket::data::{self, Data, FromData, Limits};
use rocket::http::{ContentType, Status};
use rocket::Request;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tracing::trace;

use crate::error::Error;

// Prometheus' metric label name character set, also enforced on label values
// and on the application / environment pair.
static LABEL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").unwrap());

static HOSTNAME_LABEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?$").unwrap());

const YAML_MEDIA_TYPES: [(&str, &str); 6] = [
    ("text", "vnd.yaml"),
    ("text", "yaml"),
    ("text", "x-yaml"),
    ("application", "vnd.yaml"),
    ("application", "x-yaml"),
    ("application", "yaml"),
];

/// How a request body is encoded, picked from its declared content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFormat {
    Json,
    Yaml,
    Form,
}

impl BodyFormat {
    pub fn from_content_type(content_type: Option<&ContentType>) -> Self {
        let Some(content_type) = content_type else {
            return BodyFormat::Form;
        };

        if content_type.is_json() {
            return BodyFormat::Json;
        }

        let media_type = content_type.media_type();
        let is_yaml = YAML_MEDIA_TYPES.iter().any(|(top, sub)| {
            media_type.top().as_str().eq_ignore_ascii_case(top)
                && media_type.sub().as_str().eq_ignore_ascii_case(sub)
        });

        if is_yaml {
            BodyFormat::Yaml
        } else {
            BodyFormat::Form
        }
    }
}

/// A request body that has been read but not yet decoded.
#[derive(Debug)]
pub struct RequestBody {
    format: BodyFormat,
    bytes: Vec<u8>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(crate = "rocket::serde")]
struct RawPayload {
    targets: Option<Vec<String>>,
    labels: Option<BTreeMap<String, String>>,
}

impl RequestBody {
    pub fn new(format: BodyFormat, bytes: impl Into<Vec<u8>>) -> Self {
        RequestBody {
            format,
            bytes: bytes.into(),
        }
    }

    fn decode(&self) -> Result<RawPayload, Error> {
        if self.bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(RawPayload::default());
        }

        match self.format {
            BodyFormat::Json => serde_json::from_slice(&self.bytes)
                .map_err(|err| Error::validation(format!("malformed JSON body: {}", err))),
            BodyFormat::Yaml => serde_yaml::from_slice(&self.bytes)
                .map_err(|err| Error::validation(format!("malformed YAML body: {}", err))),
            BodyFormat::Form => Ok(decode_form(&self.bytes)),
        }
    }
}

// `targets` holds a comma separated list; every other field is a label.
fn decode_form(bytes: &[u8]) -> RawPayload {
    let mut targets: Option<Vec<String>> = None;
    let mut labels = BTreeMap::new();

    for (name, value) in url::form_urlencoded::parse(bytes) {
        if name == "targets" {
            targets
                .get_or_insert_with(Vec::new)
                .extend(value.split(',').map(|target| target.trim().to_string()));
        } else {
            labels.insert(name.into_owned(), value.into_owned());
        }
    }

    RawPayload {
        targets,
        labels: (!labels.is_empty()).then_some(labels),
    }
}

#[rocket::async_trait]
impl<'r> FromData<'r> for RequestBody {
    type Error = Error;

    async fn from_data(req: &'r Request<'_>, data: Data<'r>) -> data::Outcome<'r, Self> {
        let limit = req.limits().get("json").unwrap_or(Limits::JSON);
        let format = BodyFormat::from_content_type(req.content_type());

        match data.open(limit).into_bytes().await {
            Ok(bytes) if bytes.is_complete() => {
                trace!("Read {} byte {:?} body", bytes.len(), format);
                data::Outcome::Success(RequestBody::new(format, bytes.into_inner()))
            }
            Ok(_) => data::Outcome::Error((
                Status::PayloadTooLarge,
                Error::validation(format!("request body exceeds {}", limit)),
            )),
            Err(err) => data::Outcome::Error((
                Status::BadRequest,
                Error::validation(format!("could not read request body: {}", err)),
            )),
        }
    }
}

/// The canonical form of a request body: what the registry works with.
///
/// `None` means the field was absent; present fields are never empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub targets: Option<IndexSet<String>>,
    pub labels: Option<BTreeMap<String, String>>,
}

impl Payload {
    pub fn from_body(body: &RequestBody) -> Result<Self, Error> {
        Self::normalize(body.decode()?)
    }

    fn normalize(raw: RawPayload) -> Result<Self, Error> {
        let targets = match raw.targets {
            None => None,
            Some(targets) if targets.is_empty() => {
                return Err(Error::validation("targets must not be empty"))
            }
            Some(targets) => {
                let mut set = IndexSet::with_capacity(targets.len());
                for target in targets {
                    validate_target(&target)?;
                    if !set.insert(target.clone()) {
                        return Err(Error::validation(format!("duplicate target {}", target)));
                    }
                }
                Some(set)
            }
        };

        let labels = match raw.labels {
            None => None,
            Some(labels) if labels.is_empty() => {
                return Err(Error::validation("labels must not be empty"))
            }
            Some(labels) => {
                for (name, value) in &labels {
                    validate_label(name, value)?;
                }
                Some(labels)
            }
        };

        Ok(Payload { targets, labels })
    }

    /// Neither targets nor labels were given, the equivalent of no body at all.
    pub fn is_empty(&self) -> bool {
        self.targets.is_none() && self.labels.is_none()
    }
}

pub fn valid_label_text(text: &str) -> bool {
    LABEL_RE.is_match(text)
}

pub fn validate_label(name: &str, value: &str) -> Result<(), Error> {
    if !valid_label_text(name) {
        return Err(Error::validation(format!("invalid label name {:?}", name)));
    }

    if !valid_label_text(value) {
        return Err(Error::validation(format!(
            "for label {}, invalid label value {:?}",
            name, value
        )));
    }

    Ok(())
}

/// Checks `host[:port]`, where host is a hostname, domain or IPv4 address.
pub fn validate_target(target: &str) -> Result<(), Error> {
    let (host, port) = match target.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (target, None),
    };

    if host.trim().is_empty() {
        return Err(Error::validation(format!("empty hostname in target {:?}", target)));
    }

    if host.parse::<Ipv4Addr>().is_err() && !valid_hostname(host) {
        return Err(Error::validation(format!("invalid host {:?}", host)));
    }

    if let Some(port) = port {
        let digits = !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit());
        if !digits || port.parse::<u16>().is_err() {
            return Err(Error::validation(format!("invalid port {:?} in target {:?}", port, target)));
        }
    }

    Ok(())
}

fn valid_hostname(hostname: &str) -> bool {
    let hostname = hostname.strip_suffix('.').unwrap_or(hostname);
    if hostname.is_empty() || hostname.len() > 253 {
        return false;
    }

    // a numeric TLD means a mistyped IP address
    let last = hostname.rsplit('.').next().unwrap_or_default();
    if last.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }

    hostname.split('.').all(|label| HOSTNAME_LABEL_RE.is_match(label))
}
