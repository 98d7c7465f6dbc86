//! Config template fetch and render
//!
//! - Fetches the template from an `http(s)://` or `file://` URL
//! - Substitutes `${key}` placeholders from the task overrides, `$$` is a literal `$`
//! - Any other `$` is copied as-is
//! - Unknown keys, unterminated placeholders and invalid key names are hard
//!   errors: the task fails without spawning anything
//! - Writes the rendered file under the work dir (the experiment id must be a plain
//!   directory name) and returns its SHA-256

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::protocol::PipelineKey;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("cannot fetch config {url}: {reason}")]
    Fetch { url: String, reason: String },
    #[error("unknown placeholder ${{{0}}}")]
    UnknownKey(String),
    #[error("unterminated placeholder at byte {0}")]
    Unterminated(usize),
    #[error("invalid placeholder name {0:?}")]
    InvalidKey(String),
    #[error("unsupported config URL scheme: {0}")]
    UnsupportedScheme(String),
    #[error("experiment id {0:?} is not a plain directory name")]
    UnsafeExperimentId(String),
    #[error("cannot write rendered config: {0}")]
    Io(#[from] std::io::Error),
}

/// Rendered config materialised on disk
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedConfig {
    pub path: PathBuf,
    /// `sha256:<hex>`
    pub checksum: String,
}

/// Retrieve the template text behind a config URL
pub async fn fetch_template(http: &reqwest::Client, url: &str) -> Result<String, RenderError> {
    let fail = |reason: String| RenderError::Fetch { url: url.to_string(), reason };

    if let Some(path) = url.strip_prefix("file://") {
        return tokio::fs::read_to_string(path).await.map_err(|e| fail(e.to_string()));
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(RenderError::UnsupportedScheme(url.to_string()));
    }

    let response = http.get(url).send().await.map_err(|e| fail(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(fail(format!("HTTP {status}")));
    }
    response.text().await.map_err(|e| fail(e.to_string()))
}

fn valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Substitute `${key}` placeholders
pub fn render(template: &str, overrides: &BTreeMap<String, String>) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            offset += pos + 2;
            rest = tail;
        } else if let Some(body) = after.strip_prefix('{') {
            let end = body.find('}').ok_or(RenderError::Unterminated(offset + pos))?;
            let key = &body[..end];
            if !valid_key(key) {
                return Err(RenderError::InvalidKey(key.to_string()));
            }
            let value = overrides.get(key).ok_or_else(|| RenderError::UnknownKey(key.to_string()))?;
            out.push_str(value);
            offset += pos + 2 + end + 1;
            rest = &body[end + 1..];
        } else {
            out.push('$');
            offset += pos + 1;
            rest = after;
        }
    }
    out.push_str(rest);
    Ok(out)
}

pub fn checksum(content: &str) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(content.as_bytes())))
}

/// `<work_dir>/<experiment>/<variant>-<role>.conf`, the experiment id must stay inside the work dir
pub fn config_path(work_dir: &Path, key: &PipelineKey) -> Result<PathBuf, RenderError> {
    let id = key.experiment_id.as_str();
    let plain = !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\', ':', '\0']);
    if !plain {
        return Err(RenderError::UnsafeExperimentId(id.to_string()));
    }
    Ok(work_dir.join(id).join(format!("{}-{}.conf", key.variant.as_str(), key.role.as_str())))
}

/// Fetch, render and write the config of a pipeline
pub async fn materialize(
    http: &reqwest::Client,
    url: &str,
    overrides: &BTreeMap<String, String>,
    work_dir: &Path,
    key: &PipelineKey,
) -> Result<RenderedConfig, RenderError> {
    let path = config_path(work_dir, key)?;
    let template = fetch_template(http, url).await?;
    let rendered = render(&template, overrides)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, rendered.as_bytes()).await?;
    let checksum = checksum(&rendered);
    debug!("Rendered {} ({} bytes, {})", path.display(), rendered.len(), checksum);
    Ok(RenderedConfig { path, checksum })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PipelineRole, Variant};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn key() -> PipelineKey {
        PipelineKey { experiment_id: "exp-1".into(), variant: Variant::Candidate, role: PipelineRole::Collector }
    }

    #[test]
    fn substitutes_known_keys_and_escapes() {
        let out = render(
            "batch: ${batch_size}\nhost: ${host_id}\ncost: $$5 and $HOME\n",
            &vars(&[("batch_size", "512"), ("host_id", "h-1")]),
        )
        .unwrap();
        assert_eq!(out, "batch: 512\nhost: h-1\ncost: $5 and $HOME\n");
    }

    #[test]
    fn dotted_and_dashed_keys_are_valid() {
        let out = render("${exporter.endpoint}/${tenant-id}", &vars(&[("exporter.endpoint", "x"), ("tenant-id", "t")]));
        assert_eq!(out.unwrap(), "x/t");
    }

    #[test]
    fn unknown_key_is_an_error() {
        let err = render("a ${missing} b", &vars(&[])).unwrap_err();
        assert!(matches!(err, RenderError::UnknownKey(k) if k == "missing"));
    }

    #[test]
    fn unterminated_placeholder_is_an_error() {
        let err = render("ok $$ then ${open", &vars(&[("open", "1")])).unwrap_err();
        assert!(matches!(err, RenderError::Unterminated(11)));
    }

    #[test]
    fn invalid_key_names_are_errors() {
        assert!(matches!(render("${}", &vars(&[])), Err(RenderError::InvalidKey(_))));
        assert!(matches!(render("${9lives}", &vars(&[])), Err(RenderError::InvalidKey(_))));
        assert!(matches!(render("${a b}", &vars(&[])), Err(RenderError::InvalidKey(_))));
    }

    #[test]
    fn checksum_is_stable_sha256() {
        assert_eq!(
            checksum(""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn materializes_http_template() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/configs/candidate.yaml"))
            .respond_with(ResponseTemplate::new(200).set_body_string("exporters: ${exporter}\n"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let rendered = materialize(
            &reqwest::Client::new(),
            &format!("{}/configs/candidate.yaml", server.uri()),
            &vars(&[("exporter", "otlp")]),
            dir.path(),
            &key(),
        )
        .await
        .unwrap();

        assert_eq!(rendered.path, dir.path().join("exp-1").join("candidate-collector.conf"));
        let written = std::fs::read_to_string(&rendered.path).unwrap();
        assert_eq!(written, "exporters: otlp\n");
        assert_eq!(rendered.checksum, checksum(&written));
    }

    #[tokio::test]
    async fn http_error_is_a_fetch_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).respond_with(ResponseTemplate::new(404)).mount(&server).await;

        let err = fetch_template(&reqwest::Client::new(), &format!("{}/nope", server.uri())).await.unwrap_err();
        assert!(matches!(err, RenderError::Fetch { .. }));
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn reads_file_urls_and_rejects_other_schemes() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("base.yaml");
        std::fs::write(&template, "receivers: [otlp]\n").unwrap();

        let http = reqwest::Client::new();
        let text = fetch_template(&http, &format!("file://{}", template.display())).await.unwrap();
        assert_eq!(text, "receivers: [otlp]\n");

        let err = fetch_template(&http, "ftp://host/base.yaml").await.unwrap_err();
        assert!(matches!(err, RenderError::UnsupportedScheme(u) if u == "ftp://host/base.yaml"));
        assert!(fetch_template(&http, "file:///does/not/exist.yaml").await.is_err());
    }

    #[test]
    fn experiment_ids_cannot_escape_the_work_dir() {
        let work = Path::new("/var/lib/fleetab/work");
        let mut key = key();
        assert_eq!(config_path(work, &key).unwrap(), work.join("exp-1").join("candidate-collector.conf"));

        for bad in ["../etc", "/etc", "a/b", "..", ".", "", "a\\b"] {
            key.experiment_id = bad.to_string();
            assert!(
                matches!(config_path(work, &key), Err(RenderError::UnsafeExperimentId(_))),
                "{bad:?} accepted"
            );
        }
    }
}
