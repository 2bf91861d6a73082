//! Plan definitions: parameters, validated specs and registered plans.

use crate::ids::{InputId, OutputId, PlanId};
use crate::matcher::{Offer, Requirement};
use crate::tags::{KEY_KNIT_ID, KEY_KNIT_TIMESTAMP, KEY_KNIT_TRANSIENT, Tag, TagSet};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Path at which a plan's log output is mounted.
pub const LOG_PATH: &str = "/log";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("nameless or versionless image ({0})")]
    NamelessImage(String),

    #[error("unreachable plan: no inputs")]
    NoInputs,

    #[error("bad mountpoint path (path = {path}): {reason}")]
    BadMountpointPath { path: String, reason: &'static str },

    #[error("mountpoints are overlapped: {0}, {1}")]
    OverlappedMountpoints(String, String),

    #[error("bad tag (path = {path}): {reason}")]
    BadMountpointTag { path: String, reason: String },

    #[error("on_node: invalid key: {0}")]
    InvalidOnNodeKey(String),

    #[error("on_node: invalid value: {0}")]
    InvalidOnNodeValue(String),
}

/// How strictly a plan's workers are bound to labelled nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnNodeMode {
    May,
    Prefer,
    Must,
}

impl OnNodeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnNodeMode::May => "may",
            OnNodeMode::Prefer => "prefer",
            OnNodeMode::Must => "must",
        }
    }
}

impl fmt::Display for OnNodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OnNodeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "may" => Ok(OnNodeMode::May),
            "prefer" => Ok(OnNodeMode::Prefer),
            "must" => Ok(OnNodeMode::Must),
            other => Err(format!("unknown on_node mode: {}", other)),
        }
    }
}

/// Node affinity entry: a Kubernetes label with a scheduling mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OnNode {
    pub mode: OnNodeMode,
    pub key: String,
    pub value: String,
}

impl OnNode {
    fn sort_key(&self) -> (&str, &str, &str) {
        (self.mode.as_str(), &self.key, &self.value)
    }
}

impl fmt::Display for OnNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}:{}", self.key, self.value, self.mode)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Annotation {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPointParam {
    pub path: String,
    pub tags: TagSet,
}

impl MountPointParam {
    pub fn new(path: impl Into<String>, tags: TagSet) -> Self {
        Self {
            path: path.into(),
            tags,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogParam {
    pub tags: TagSet,
}

/// Unvalidated plan definition as submitted by a user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanParam {
    pub image: String,
    pub version: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub inputs: Vec<MountPointParam>,
    #[serde(default)]
    pub outputs: Vec<MountPointParam>,
    #[serde(default)]
    pub log: Option<LogParam>,
    #[serde(default)]
    pub on_node: Vec<OnNode>,
    /// Resource name (cpu, memory, ...) to quantity.
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
    #[serde(default)]
    pub service_account: Option<String>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

// https://kubernetes.io/docs/concepts/overview/working-with-objects/labels/#syntax-and-character-set
static LABEL_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^([a-zA-Z0-9]([-a-zA-Z0-9]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([-a-zA-Z0-9]{0,61}[a-zA-Z0-9])?)*/)?[a-zA-Z0-9]([-a-zA-Z0-9]{0,61}[a-zA-Z0-9])?$",
    )
    .unwrap()
});
static LABEL_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9]([-._a-zA-Z0-9]{0,61}[a-zA-Z0-9])?$").unwrap());

impl PlanParam {
    /// Validate and normalize into a [`PlanSpec`], computing its hash.
    ///
    /// Normalization sorts mountpoints by path and on-node entries by
    /// `(mode, key, value)`, and trims one trailing `/` from each path.
    pub fn validate(self) -> Result<PlanSpec, ValidationError> {
        let mut on_node = self.on_node;
        on_node.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        for on in &on_node {
            validate_on_node(on)?;
        }

        if self.image.is_empty() || self.version.is_empty() {
            return Err(ValidationError::NamelessImage(format!(
                "{}:{}",
                self.image, self.version
            )));
        }

        if self.inputs.is_empty() {
            return Err(ValidationError::NoInputs);
        }
        let inputs = normalize_mountpoints(self.inputs)?;
        let outputs = normalize_mountpoints(self.outputs)?;

        for input in &inputs {
            check_clean_path(&input.path)?;
            validate_input_tags(input)?;
        }
        for output in &outputs {
            check_clean_path(&output.path)?;
            if !output.tags.system_tags().is_empty() {
                return Err(ValidationError::BadMountpointTag {
                    path: output.path.clone(),
                    reason: "output cannot have tag starting with \"knit#\" (reserved by system)"
                        .to_string(),
                });
            }
        }
        check_no_overlaps(&inputs, &outputs)?;

        if let Some(log) = &self.log {
            if !log.tags.system_tags().is_empty() {
                return Err(ValidationError::BadMountpointTag {
                    path: "log".to_string(),
                    reason: "log cannot have tag starting with \"knit#\" (reserved by system)"
                        .to_string(),
                });
            }
        }

        let mut spec = PlanSpec {
            image: self.image,
            version: self.version,
            active: self.active,
            entrypoint: self.entrypoint,
            args: self.args,
            inputs,
            outputs,
            log: self.log,
            on_node,
            resources: self.resources,
            service_account: self.service_account,
            annotations: self.annotations,
            hash: String::new(),
        };
        spec.hash = spec.compute_hash();
        Ok(spec)
    }
}

fn validate_on_node(on: &OnNode) -> Result<(), ValidationError> {
    if on.key.is_empty() {
        return Err(ValidationError::InvalidOnNodeKey("key is empty".to_string()));
    }
    if !LABEL_KEY.is_match(&on.key) {
        return Err(ValidationError::InvalidOnNodeKey(format!(
            "bad pattern: {}",
            on.key
        )));
    }
    if let Some((prefix, _)) = on.key.split_once('/') {
        if prefix.len() > 253 {
            return Err(ValidationError::InvalidOnNodeKey(format!(
                "too long (> 253 chars) prefix: {}",
                on.key
            )));
        }
    }

    if on.value.is_empty() {
        return Err(ValidationError::InvalidOnNodeValue(
            "value is empty".to_string(),
        ));
    }
    if !LABEL_VALUE.is_match(&on.value) {
        return Err(ValidationError::InvalidOnNodeValue(format!(
            "bad pattern: {}",
            on.value
        )));
    }
    Ok(())
}

fn normalize_mountpoints(
    mut mountpoints: Vec<MountPointParam>,
) -> Result<Vec<MountPointParam>, ValidationError> {
    for mp in &mut mountpoints {
        if mp.path.is_empty() {
            return Err(ValidationError::BadMountpointPath {
                path: String::new(),
                reason: "path is empty",
            });
        }
        if let Some(trimmed) = mp.path.strip_suffix('/') {
            mp.path = trimmed.to_string();
        }
    }
    mountpoints.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(mountpoints)
}

/// Absolute, with no empty, `.` or `..` segments.
fn is_clean_absolute(path: &str) -> bool {
    match path.strip_prefix('/') {
        None => false,
        Some("") => true,
        Some(rest) => rest
            .split('/')
            .all(|seg| !seg.is_empty() && seg != "." && seg != ".."),
    }
}

fn check_clean_path(path: &str) -> Result<(), ValidationError> {
    if is_clean_absolute(path) {
        Ok(())
    } else {
        Err(ValidationError::BadMountpointPath {
            path: path.to_string(),
            reason: "not absolute or not clean",
        })
    }
}

/// One path is the other, or a directory containing it.
fn paths_overlap(a: &str, b: &str) -> bool {
    a == b || a.starts_with(&format!("{}/", b)) || b.starts_with(&format!("{}/", a))
}

fn check_no_overlaps(
    inputs: &[MountPointParam],
    outputs: &[MountPointParam],
) -> Result<(), ValidationError> {
    let paths: Vec<&str> = inputs
        .iter()
        .chain(outputs.iter())
        .map(|mp| mp.path.as_str())
        .collect();
    for (nth, a) in paths.iter().enumerate() {
        for b in &paths[nth + 1..] {
            if paths_overlap(a, b) {
                return Err(ValidationError::OverlappedMountpoints(
                    a.to_string(),
                    b.to_string(),
                ));
            }
        }
    }
    Ok(())
}

fn validate_input_tags(input: &MountPointParam) -> Result<(), ValidationError> {
    let bad = |reason: String| ValidationError::BadMountpointTag {
        path: input.path.clone(),
        reason,
    };

    if input.tags.is_empty() {
        return Err(bad("no tags for input".to_string()));
    }

    let mut knit_id: Option<&Tag> = None;
    let mut timestamp: Option<&Tag> = None;
    for tag in input.tags.iter().filter(|t| t.is_system_tag()) {
        match tag.key() {
            KEY_KNIT_TRANSIENT => {
                return Err(bad(
                    "data with \"knit#transient\" are never used".to_string(),
                ));
            }
            KEY_KNIT_ID => {
                if knit_id.is_some_and(|seen| seen != tag) {
                    return Err(bad("\"knit#id:...\" found twice (or more)".to_string()));
                }
                knit_id = Some(tag);
            }
            KEY_KNIT_TIMESTAMP => {
                if timestamp.is_some_and(|seen| seen != tag) {
                    return Err(bad(
                        "\"knit#timestamp:...\" found twice (or more)".to_string(),
                    ));
                }
                timestamp = Some(tag);
            }
            _ => return Err(bad(format!("unknown system tag: {}", tag))),
        }
    }
    Ok(())
}

/// A validated plan definition, ready for registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanSpec {
    image: String,
    version: String,
    active: bool,
    entrypoint: Vec<String>,
    args: Vec<String>,
    inputs: Vec<MountPointParam>,
    outputs: Vec<MountPointParam>,
    log: Option<LogParam>,
    on_node: Vec<OnNode>,
    resources: BTreeMap<String, String>,
    service_account: Option<String>,
    annotations: Vec<Annotation>,
    hash: String,
}

impl PlanSpec {
    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn entrypoint(&self) -> &[String] {
        &self.entrypoint
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn inputs(&self) -> &[MountPointParam] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[MountPointParam] {
        &self.outputs
    }

    pub fn log(&self) -> Option<&LogParam> {
        self.log.as_ref()
    }

    pub fn on_node(&self) -> &[OnNode] {
        &self.on_node
    }

    pub fn resources(&self) -> &BTreeMap<String, String> {
        &self.resources
    }

    pub fn service_account(&self) -> Option<&str> {
        self.service_account.as_deref()
    }

    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Override the computed hash.
    ///
    /// Hash collisions are expected to be rare but possible; this lets callers
    /// (and tests) register plans whose hash was computed elsewhere.
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = hash.into();
        self
    }

    fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.image.as_bytes());
        hasher.update(self.version.as_bytes());

        for on in &self.on_node {
            hasher.update(on.to_string().as_bytes());
        }

        for mp in self.inputs.iter().chain(self.outputs.iter()) {
            hasher.update(mp.path.as_bytes());
            for tag in &mp.tags {
                hasher.update(tag.to_string().as_bytes());
            }
        }
        if let Some(log) = &self.log {
            hasher.update(LOG_PATH.as_bytes());
            for tag in &log.tags {
                hasher.update(tag.to_string().as_bytes());
            }
        }
        if !self.entrypoint.is_empty() {
            hasher.update(b"[entrypoint]");
            for item in &self.entrypoint {
                hasher.update(item.as_bytes());
            }
        }
        if !self.args.is_empty() {
            hasher.update(b"[args]");
            for item in &self.args {
                hasher.update(item.as_bytes());
            }
        }

        format!("{:x}", hasher.finalize())
    }

    /// Whether `plan` is a structural duplicate of this spec.
    ///
    /// Mountpoints compare as sets of `(path, tags)`; ids are ignored.
    pub fn equiv_plan(&self, plan: &Plan) -> bool {
        let body = &plan.body;
        if self.hash != body.hash || self.image != body.image || self.version != body.version {
            return false;
        }

        let log_equiv = match (&self.log, &plan.log) {
            (None, None) => true,
            (Some(spec), Some(registered)) => spec.tags == registered.tags,
            _ => false,
        };
        if !log_equiv {
            return false;
        }

        let spec_inputs: BTreeSet<(&str, &TagSet)> = self
            .inputs
            .iter()
            .map(|mp| (mp.path.as_str(), &mp.tags))
            .collect();
        let plan_inputs: BTreeSet<(&str, &TagSet)> = plan
            .inputs
            .iter()
            .map(|mp| (mp.path.as_str(), &mp.tags))
            .collect();
        if spec_inputs != plan_inputs {
            return false;
        }

        let spec_outputs: BTreeSet<(&str, &TagSet)> = self
            .outputs
            .iter()
            .map(|mp| (mp.path.as_str(), &mp.tags))
            .collect();
        let plan_outputs: BTreeSet<(&str, &TagSet)> = plan
            .outputs
            .iter()
            .map(|mp| (mp.path.as_str(), &mp.tags))
            .collect();
        if spec_outputs != plan_outputs {
            return false;
        }

        let spec_on_node: BTreeSet<(&str, &str, &str)> =
            self.on_node.iter().map(OnNode::sort_key).collect();
        let plan_on_node: BTreeSet<(&str, &str, &str)> =
            body.on_node.iter().map(OnNode::sort_key).collect();

        spec_on_node == plan_on_node
            && self.entrypoint == body.entrypoint
            && self.args == body.args
            && self.resources == body.resources
    }
}

/// Plan attributes, without its mountpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanBody {
    pub plan_id: PlanId,
    pub hash: String,
    pub active: bool,
    pub image: String,
    pub version: String,
    pub entrypoint: Vec<String>,
    pub args: Vec<String>,
    pub on_node: Vec<OnNode>,
    pub resources: BTreeMap<String, String>,
    pub service_account: Option<String>,
    pub annotations: Vec<Annotation>,
}

impl PlanBody {
    /// `image:version`
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.version)
    }
}

/// A registered plan with its mountpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub body: PlanBody,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub log: Option<LogPoint>,
}

impl Plan {
    pub fn id(&self) -> PlanId {
        self.body.plan_id
    }

    /// Every output that can feed a downstream input: the regular outputs
    /// followed by the log, if any.
    pub fn feeding_outputs(&self) -> Vec<Output> {
        let mut outputs = self.outputs.clone();
        outputs.extend(self.log.as_ref().map(|log| log.as_output(self.id())));
        outputs
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    pub id: InputId,
    pub plan_id: PlanId,
    pub path: String,
    pub tags: TagSet,
}

impl Input {
    pub fn requirement(&self) -> Requirement {
        Requirement::from_tags(&self.tags)
    }

    /// Whether upstream outputs can feed this input without manual choice.
    pub fn is_automatic(&self) -> bool {
        self.requirement().is_automatic()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub id: OutputId,
    pub plan_id: PlanId,
    pub path: String,
    pub tags: TagSet,
}

impl Output {
    pub fn offer(&self) -> Offer<'_> {
        Offer::output(&self.tags)
    }
}

/// The log output of a plan, mounted at [`LOG_PATH`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPoint {
    pub id: OutputId,
    pub tags: TagSet,
}

impl LogPoint {
    /// The log as the output row it is stored as.
    pub fn as_output(&self, plan_id: PlanId) -> Output {
        Output {
            id: self.id,
            plan_id,
            path: LOG_PATH.to_string(),
            tags: self.tags.clone(),
        }
    }
}

/// Ids assigned to a plan's mountpoints on insertion, in `PlanSpec` order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountpointIds {
    pub inputs: Vec<InputId>,
    pub outputs: Vec<OutputId>,
    pub log: Option<OutputId>,
}
