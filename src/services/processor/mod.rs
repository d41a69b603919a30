//! Derivative graph: named processing steps fed by the original upload or by each other.

use crate::services::upload::Artifact;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};
use utoipa::ToSchema;

pub mod mover;
pub mod resizer;

pub use mover::Mover;
pub use resizer::Resizer;

/// Source name of steps that consume the uploaded original.
pub const SOURCE_ORIGINAL: &str = ":original:";

/// One transformation step of the derivative graph.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Unique within one run; also the key of the produced version.
    fn name(&self) -> &str;

    /// `SOURCE_ORIGINAL` or the name of a previously registered step.
    fn source(&self) -> &str;

    /// Whether this step handles the coarse category (e.g. "image") of its input.
    fn can_process(&self, category: &str) -> bool;

    async fn process(&self, source: &Artifact) -> anyhow::Result<Artifact>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("processor name '{0}' already exists")]
    DuplicateName(String),

    #[error("source processor '{upstream}' of '{name}' does not exist")]
    UnknownSource { name: String, upstream: String },

    #[error("processor '{name}' is registered before its source '{upstream}'")]
    OutOfOrder { name: String, upstream: String },
}

/// Applied to every step result before it is recorded.
pub type AfterProcessFn = dyn Fn(anyhow::Result<Artifact>) -> anyhow::Result<Artifact> + Send + Sync;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FileMeta {
    #[serde(rename = "type")]
    pub kind: String,
    pub mime: String,
    pub size: u64,
}

impl From<&Artifact> for FileMeta {
    fn from(a: &Artifact) -> Self {
        Self {
            kind: a.kind.clone().unwrap_or_default(),
            mime: a.mime.clone().unwrap_or_default(),
            size: a.size,
        }
    }
}

/// Outcome of one step: the derived file, or the reason it could not be produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FileVersion {
    /// Name of the step this version was derived from.
    pub source: String,
    #[serde(skip)]
    pub source_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub filepath: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<FileMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The original plus every version produced from it, keyed by step name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FileResult {
    #[serde(flatten)]
    pub file: Artifact,
    pub versions: BTreeMap<String, FileVersion>,
}

impl FileResult {
    pub fn failed(file: Artifact) -> Self {
        Self {
            file,
            versions: BTreeMap::new(),
        }
    }
}

struct ProcessEntry {
    processor: Arc<dyn Processor>,
    /// Input artifact; `None` until the upstream step has produced output.
    source: Option<Artifact>,
    upstream: Option<usize>,
    downstream: Vec<usize>,
}

#[derive(Default)]
struct Registry {
    entries: Vec<ProcessEntry>,
    index: HashMap<String, usize>,
}

/// Serializable view of one registered entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySnapshot {
    pub name: String,
    pub source: String,
    pub ready: bool,
    pub upstream: Option<usize>,
    pub downstream: Vec<usize>,
}

/// Owns the step graph for one original artifact. Consumed by [`ProcessManager::run`].
pub struct ProcessManager {
    original: Artifact,
    registry: Mutex<Registry>,
}

impl ProcessManager {
    pub fn new(original: Artifact) -> Self {
        Self {
            original,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Registers a step. Its source must be the original or an already registered step.
    pub fn add(&self, processor: Arc<dyn Processor>) -> Result<(), GraphError> {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);

        let name = processor.name().to_string();
        if registry.index.contains_key(&name) {
            return Err(GraphError::DuplicateName(name));
        }

        let position = registry.entries.len();
        let (source, upstream) = if processor.source() == SOURCE_ORIGINAL {
            (Some(self.original.clone()), None)
        } else {
            let upstream = *registry.index.get(processor.source()).ok_or_else(|| {
                GraphError::UnknownSource {
                    name: name.clone(),
                    upstream: processor.source().to_string(),
                }
            })?;
            registry.entries[upstream].downstream.push(position);
            (None, Some(upstream))
        };

        registry.entries.push(ProcessEntry {
            processor,
            source,
            upstream,
            downstream: Vec::new(),
        });
        registry.index.insert(name, position);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry
            .entries
            .iter()
            .map(|e| EntrySnapshot {
                name: e.processor.name().to_string(),
                source: e.processor.source().to_string(),
                ready: e.source.is_some(),
                upstream: e.upstream,
                downstream: e.downstream.clone(),
            })
            .collect()
    }

    /// Executes the steps in registration order.
    ///
    /// A step without input (its upstream failed or was skipped) or whose category
    /// check fails is skipped and leaves no version. A failing step is recorded and
    /// the remaining steps still run.
    pub async fn run(self, after: &AfterProcessFn) -> Result<FileResult, GraphError> {
        let Registry { mut entries, .. } = self
            .registry
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);

        check_order(&entries)?;

        let mut versions = BTreeMap::new();
        for position in 0..entries.len() {
            let processor = Arc::clone(&entries[position].processor);
            let name = processor.name().to_string();

            let Some(source) = entries[position].source.take() else {
                debug!("Skipping processor {}: no input from {}", name, processor.source());
                continue;
            };
            if !processor.can_process(source.category()) {
                debug!(
                    "Skipping processor {}: cannot handle '{}'",
                    name,
                    source.category()
                );
                continue;
            }

            let mut version = FileVersion {
                source: processor.source().to_string(),
                source_path: source.filepath.clone(),
                ..Default::default()
            };

            match after(processor.process(&source).await) {
                Ok(output) => {
                    version.filepath = Some(output.filepath.clone());
                    version.url = output.url.clone();
                    version.meta = Some(FileMeta::from(&output));

                    let downstream = entries[position].downstream.clone();
                    for d in downstream {
                        entries[d].source = Some(output.clone());
                    }
                }
                Err(e) => {
                    warn!("Processor {} failed for {}: {:#}", name, self.original.name, e);
                    version.error = Some(format!("processor {} failed: {:#}", name, e));
                }
            }
            versions.insert(name, version);
        }

        Ok(FileResult {
            file: self.original,
            versions,
        })
    }
}

/// Every upstream must come strictly before its downstream in registration order.
fn check_order(entries: &[ProcessEntry]) -> Result<(), GraphError> {
    for (position, entry) in entries.iter().enumerate() {
        let out_of_order = entry.upstream.is_some_and(|u| u >= position)
            || entry.downstream.iter().any(|&d| d <= position);
        if out_of_order {
            return Err(GraphError::OutOfOrder {
                name: entry.processor.name().to_string(),
                upstream: entry.processor.source().to_string(),
            });
        }
    }
    Ok(())
}

/// Registers `processors` in order against `original` and runs them.
pub async fn process_file(
    original: Artifact,
    after: &AfterProcessFn,
    processors: Vec<Arc<dyn Processor>>,
) -> Result<FileResult, GraphError> {
    let manager = ProcessManager::new(original);
    for processor in processors {
        manager.add(processor)?;
    }
    manager.run(after).await
}

/// After-hook that records results unchanged.
pub fn identity(result: anyhow::Result<Artifact>) -> anyhow::Result<Artifact> {
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Appends its name to the input path and counts invocations.
    struct Step {
        name: String,
        source: String,
        accepts: Option<&'static str>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl Step {
        fn new(name: &str, source: &str) -> Self {
            Self {
                name: name.to_string(),
                source: source.to_string(),
                accepts: None,
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn only(mut self, category: &'static str) -> Self {
            self.accepts = Some(category);
            self
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }
    }

    #[async_trait]
    impl Processor for Step {
        fn name(&self) -> &str {
            &self.name
        }

        fn source(&self) -> &str {
            &self.source
        }

        fn can_process(&self, category: &str) -> bool {
            self.accepts.is_none_or(|c| c == category)
        }

        async fn process(&self, source: &Artifact) -> anyhow::Result<Artifact> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("tool exited with status 1"));
            }
            let mut out = source.clone();
            out.filepath = PathBuf::from(format!("{}+{}", source.filepath.display(), self.name));
            Ok(out)
        }
    }

    fn dyn_step(step: Step) -> Arc<dyn Processor> {
        Arc::new(step)
    }

    fn original(kind: &str) -> Artifact {
        let mut a = Artifact::new("a.jpg", "sid", "/up/a", 10);
        a.kind = Some(kind.to_string());
        a.mime = Some(format!("{}/x", kind));
        a
    }

    #[test]
    fn test_unknown_source_fails_at_registration() {
        let pm = ProcessManager::new(original("image"));
        let err = pm
            .add(Arc::new(Step::new("thumb", "default")))
            .unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownSource {
                name: "thumb".to_string(),
                upstream: "default".to_string()
            }
        );
        assert!(pm.is_empty());
    }

    #[test]
    fn test_duplicate_name_fails() {
        let pm = ProcessManager::new(original("image"));
        pm.add(Arc::new(Step::new("default", SOURCE_ORIGINAL))).unwrap();
        assert_eq!(
            pm.add(Arc::new(Step::new("default", SOURCE_ORIGINAL))),
            Err(GraphError::DuplicateName("default".to_string()))
        );
    }

    #[tokio::test]
    async fn test_process_file_stops_before_running_on_bad_graph() {
        let first = Arc::new(Step::new("default", SOURCE_ORIGINAL));
        let result = process_file(
            original("image"),
            &identity,
            vec![first.clone() as Arc<dyn Processor>, dyn_step(Step::new("thumb", "missing"))],
        )
        .await;
        assert!(matches!(result, Err(GraphError::UnknownSource { .. })));
        assert_eq!(first.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_snapshot_links() {
        let pm = ProcessManager::new(original("image"));
        pm.add(Arc::new(Step::new("a", SOURCE_ORIGINAL))).unwrap();
        pm.add(Arc::new(Step::new("b", "a"))).unwrap();
        pm.add(Arc::new(Step::new("c", "a"))).unwrap();
        pm.add(Arc::new(Step::new("d", "b"))).unwrap();

        let snap = pm.snapshot();
        assert_eq!(snap[0].downstream, vec![1, 2]);
        assert_eq!(snap[1].upstream, Some(0));
        assert_eq!(snap[3].upstream, Some(1));
        assert!(snap[0].ready);
        assert!(!snap[3].ready);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json[2]["source"], "a");
    }

    #[tokio::test]
    async fn test_chain_feeds_outputs_downstream() {
        let result = process_file(
            original("image"),
            &identity,
            vec![
                dyn_step(Step::new("a", SOURCE_ORIGINAL)),
                dyn_step(Step::new("b", "a")),
                dyn_step(Step::new("c", "b")),
            ],
        )
        .await
        .unwrap();

        let c = &result.versions["c"];
        assert_eq!(c.source, "b");
        assert_eq!(c.source_path, PathBuf::from("/up/a+a+b"));
        assert_eq!(c.filepath, Some(PathBuf::from("/up/a+a+b+c")));
        assert_eq!(result.file.filepath, PathBuf::from("/up/a"));
    }

    #[tokio::test]
    async fn test_category_mismatch_is_skipped() {
        let thumb = Arc::new(Step::new("thumb", "default").only("image"));
        let result = process_file(
            original("text"),
            &identity,
            vec![dyn_step(Step::new("default", SOURCE_ORIGINAL)), thumb.clone() as Arc<dyn Processor>],
        )
        .await
        .unwrap();

        assert!(result.versions.contains_key("default"));
        assert!(!result.versions.contains_key("thumb"));
        assert_eq!(thumb.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failure_is_recorded_and_downstream_skipped() {
        let after_failed = Arc::new(Step::new("c", "b"));
        let result = process_file(
            original("image"),
            &identity,
            vec![
                dyn_step(Step::new("a", SOURCE_ORIGINAL)),
                dyn_step(Step::new("b", "a").failing()),
                after_failed.clone() as Arc<dyn Processor>,
                dyn_step(Step::new("sibling", "a")),
            ],
        )
        .await
        .unwrap();

        let b = &result.versions["b"];
        assert_eq!(
            b.error.as_deref(),
            Some("processor b failed: tool exited with status 1")
        );
        assert_eq!(b.filepath, None);
        assert!(!result.versions.contains_key("c"));
        assert_eq!(after_failed.calls.load(Ordering::SeqCst), 0);
        assert!(result.versions["sibling"].error.is_none());
    }

    #[tokio::test]
    async fn test_after_hook_sees_every_result() {
        let hook = |r: anyhow::Result<Artifact>| {
            r.map(|mut a| {
                a.url = Some(format!("/files/{}", a.filepath.display()));
                a
            })
            .map_err(|e| e.context("hooked"))
        };
        let result = process_file(
            original("image"),
            &hook,
            vec![
                dyn_step(Step::new("ok", SOURCE_ORIGINAL)),
                dyn_step(Step::new("bad", SOURCE_ORIGINAL).failing()),
            ],
        )
        .await
        .unwrap();

        assert_eq!(result.versions["ok"].url.as_deref(), Some("/files//up/a+ok"));
        assert!(
            result.versions["bad"]
                .error
                .as_deref()
                .unwrap()
                .starts_with("processor bad failed: hooked")
        );
    }

    #[test]
    fn test_check_order_rejects_backward_links() {
        let entries = vec![
            ProcessEntry {
                processor: Arc::new(Step::new("c", "b")),
                source: None,
                upstream: Some(1),
                downstream: Vec::new(),
            },
            ProcessEntry {
                processor: Arc::new(Step::new("b", SOURCE_ORIGINAL)),
                source: Some(original("image")),
                upstream: None,
                downstream: vec![0],
            },
        ];
        assert_eq!(
            check_order(&entries),
            Err(GraphError::OutOfOrder {
                name: "c".to_string(),
                upstream: "b".to_string()
            })
        );
    }

    #[test]
    fn test_result_json_shape() {
        let mut result = FileResult::failed(original("image"));
        result.versions.insert(
            "default".to_string(),
            FileVersion {
                source: SOURCE_ORIGINAL.to_string(),
                filepath: Some(PathBuf::from("/data/image/2024/1/2/x.jpg")),
                url: Some("/files/image/2024/1/2/x.jpg".to_string()),
                meta: Some(FileMeta::from(&original("image"))),
                ..Default::default()
            },
        );

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["name"], "a.jpg");
        assert_eq!(json["type"], "image");
        assert_eq!(json["versions"]["default"]["meta"]["type"], "image");
        assert_eq!(json["versions"]["default"]["url"], "/files/image/2024/1/2/x.jpg");
        assert!(json["versions"]["default"].get("source_path").is_none());
    }
}
