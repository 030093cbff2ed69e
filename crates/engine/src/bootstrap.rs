//! Builds the payload an instance boots with.
//!
//! The payload is a docker-compose document with a single service. Its
//! command decodes an embedded bash script which downloads the run's code
//! package, installs dependencies, runs the step and, from an `EXIT` trap,
//! uploads the sentinel record carrying the step's exit code.

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use cvmstep_storage::ObjectStore;
use cvmstep_types::{BootstrapPayload, InstanceSpec, RunArtifact, StepDescriptor};
use indexmap::IndexMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::DispatchError;

/// Name of the only service in the compose document.
pub const SERVICE_NAME: &str = "step-runner";
/// Present (as `1`) inside every instance so step code can detect remote execution.
pub const WORKLOAD_ENV: &str = "CVMSTEP_WORKLOAD";
pub const INSTANCE_NAME_ENV: &str = "CVMSTEP_INSTANCE_NAME";

const MAX_INSTANCE_NAME_LEN: usize = 63;
const NAME_PREFIX: &str = "cvm";
const NAME_HASH_LEN: usize = 8;

const SCRIPT_PATH: &str = "/tmp/cvmstep-bootstrap.sh";

const SCRIPT_PRELUDE: &str = r#"#!/bin/bash
set -e
export CVMSTEP_LOG_STDOUT=/dev/stdout
export CVMSTEP_LOG_STDERR=/dev/stderr

fetch() {
  if command -v curl >/dev/null 2>&1; then
    curl -fsSL --retry 5 -o "$2" "$1"
  else
    python3 -c 'import sys, urllib.request; urllib.request.urlretrieve(sys.argv[1], sys.argv[2])' "$1" "$2"
  fi
}

upload() {
  if command -v curl >/dev/null 2>&1; then
    curl -fsS --retry 5 -T "$2" "$1"
  else
    python3 -c 'import sys, urllib.request; urllib.request.urlopen(urllib.request.Request(sys.argv[1], data=open(sys.argv[2], "rb").read(), method="PUT"))' "$1" "$2"
  fi
}

write_sentinel() {
  local code=$?
  set +e
  printf '{"key":"%s","exit_code":%d,"written_at":"%s"}' \
    "$CVMSTEP_SENTINEL_OBJECT" "$code" "$(date -u +%Y-%m-%dT%H:%M:%SZ)" > /tmp/cvmstep-sentinel.json
  upload "$CVMSTEP_SENTINEL_URL" /tmp/cvmstep-sentinel.json
  exit "$code"
}
trap write_sentinel EXIT

mkdir -p /tmp/cvmstep-work
cd /tmp/cvmstep-work
fetch "$CVMSTEP_ARTIFACT_URL" package.tar.gz
echo "$CVMSTEP_ARTIFACT_SHA256  package.tar.gz" | sha256sum -c -
tar -xzf package.tar.gz
"#;

#[derive(Debug, Serialize)]
struct ComposeDocument<'a> {
    services: IndexMap<&'static str, ComposeService<'a>>,
}

#[derive(Debug, Serialize)]
struct ComposeService<'a> {
    image: &'a str,
    restart: &'static str,
    command: Vec<String>,
    environment: &'a IndexMap<&'a str, String>,
}

/// Renders [`BootstrapPayload`]s against a specific object store, whose URLs
/// the remote script uses for the package download and sentinel upload.
#[derive(Debug, Clone)]
pub struct BootstrapComposer {
    store: Arc<dyn ObjectStore>,
}

impl BootstrapComposer {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Compose the payload for one step invocation.
    ///
    /// Every `spec.env` entry is injected verbatim; protocol variables are
    /// appended afterwards and take precedence on collision.
    pub fn compose(
        &self,
        spec: &InstanceSpec,
        artifact: &RunArtifact,
        sentinel_key: &str,
        step: &StepDescriptor,
    ) -> Result<BootstrapPayload, DispatchError> {
        let name = instance_name(&step.flow_name, &step.step_name, &step.task_id, step.attempt);

        let mut environment = spec.env.clone();
        let protocol_env = [
            (WORKLOAD_ENV, "1".to_string()),
            (INSTANCE_NAME_ENV, name.clone()),
            ("CVMSTEP_RUN_ID", step.run_id.clone()),
            ("CVMSTEP_STEP_NAME", step.step_name.clone()),
            ("CVMSTEP_TASK_ID", step.task_id.clone()),
            ("CVMSTEP_ATTEMPT", step.attempt.to_string()),
            ("CVMSTEP_ARTIFACT_URL", self.store.object_url(&artifact.storage_key)),
            ("CVMSTEP_ARTIFACT_SHA256", artifact.content_hash.clone()),
            ("CVMSTEP_SENTINEL_OBJECT", sentinel_key.to_string()),
            ("CVMSTEP_SENTINEL_URL", self.store.object_url(sentinel_key)),
        ];
        for (key, value) in protocol_env {
            if environment.contains_key(key) {
                warn!(variable = key, "step environment overrides a reserved variable; using the dispatcher's value");
            }
            environment.insert(key.to_string(), value);
        }

        let script = build_script(&step.setup_commands, &step.command);
        let encoded_script = STANDARD.encode(script.as_bytes());
        let compose_file = build_compose_yaml(&spec.image, &environment, &encoded_script)?;

        Ok(BootstrapPayload {
            instance_name: name,
            image: spec.image.clone(),
            resources: spec.resources(),
            environment,
            encoded_script,
            compose_file,
        })
    }
}

/// Assemble the bootstrap script run inside the instance.
pub fn build_script(setup_commands: &[String], command: &str) -> String {
    let mut script = String::from(SCRIPT_PRELUDE);
    for setup in setup_commands.iter().filter(|line| !line.trim().is_empty()) {
        script.push_str(setup);
        script.push('\n');
    }
    script.push_str("\nset +e\n");
    script.push_str(command);
    script.push_str("\nSTEP_EXIT=$?\nexit $STEP_EXIT\n");
    script
}

/// Render the compose document for `image` with `environment`.
pub fn build_compose_yaml(
    image: &str,
    environment: &IndexMap<String, String>,
    encoded_script: &str,
) -> Result<String, serde_yaml::Error> {
    let launcher = escape_interpolation(&format!(
        "echo '{encoded_script}' | base64 -d > {SCRIPT_PATH} && exec /bin/bash {SCRIPT_PATH}"
    ));
    let environment: IndexMap<&str, String> = environment
        .iter()
        .map(|(key, value)| (key.as_str(), escape_interpolation(value)))
        .collect();
    let mut services = IndexMap::new();
    services.insert(
        SERVICE_NAME,
        ComposeService {
            image,
            restart: "no",
            command: vec!["/bin/bash".to_string(), "-c".to_string(), launcher],
            environment: &environment,
        },
    );
    serde_yaml::to_string(&ComposeDocument { services })
}

/// Double every `$` so compose passes the value through without expanding
/// `$VAR` or `${VAR}`.
fn escape_interpolation(value: &str) -> String {
    value.replace('$', "$$")
}

/// Deterministic DNS-safe instance name for one step invocation.
///
/// The name is lowercase, starts with a letter, stays within 63 characters
/// and ends with a short hash of the full identity, so truncated long names
/// remain unique per task and attempt.
pub fn instance_name(flow: &str, step: &str, task_id: &str, attempt: u32) -> String {
    let identity = format!("{flow}\u{1f}{step}\u{1f}{task_id}\u{1f}{attempt}");
    let digest = hex::encode(Sha256::digest(identity.as_bytes()));
    let hash = &digest[..NAME_HASH_LEN];

    let slug = slugify(&format!("{flow}-{step}-{task_id}-{attempt}"));
    let budget = MAX_INSTANCE_NAME_LEN - NAME_PREFIX.len() - NAME_HASH_LEN - 2;
    let truncated = slug[..slug.len().min(budget)].trim_end_matches('-');

    if truncated.is_empty() {
        format!("{NAME_PREFIX}-{hash}")
    } else {
        format!("{NAME_PREFIX}-{truncated}-{hash}")
    }
}

fn slugify(raw: &str) -> String {
    let mut slug = String::with_capacity(raw.len());
    for character in raw.chars() {
        if character.is_ascii_alphanumeric() {
            slug.push(character.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}
