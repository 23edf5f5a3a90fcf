//! Learning Store — failure signatures aggregated into reusable guidance.
//!
//! Every validation failure is classified, normalized into a stable
//! pattern, and upserted as an ImprovementRecord. Before each dispatch the
//! orchestrator pulls the top records for the item's kind and injects them
//! into the worker's brief as "avoid these known mistakes" guidance. The
//! store is advisory: its failures are logged and never block dispatch.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, RwLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DispatchError, DispatchResult};
use crate::work::WorkKind;

/// Sliding window of recent sightings kept per record for trend detection.
const TREND_WINDOW: usize = 12;

static IMPORT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(unresolved import|cannot find (module|crate|name)|not found in scope|ModuleNotFound)").unwrap()
});

static TYPE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(mismatched types|type error|expected .+, found|is not assignable|TypeError)").unwrap()
});

static TEST_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(assertion (failed|error)|test(s)? failed|FAILED|panicked at)").unwrap()
});

static CONFLICT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(merge conflict|<<<<<<<|conflict(s)? detected)").unwrap());

static INTEGRATION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(integration|connection refused|dependency .+ (open|missing)|timed? ?out)").unwrap()
});

static QUALITY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(lint|style|warning: unused|clippy|format)").unwrap());

/// Strip line/column numbers and hex ids so equivalent failures share one
/// pattern.
static NOISE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(:\d+(:\d+)?)|\b[0-9a-f]{7,40}\b|\d{3,}").unwrap());

/// Failure categories, tagged onto every improvement record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Imports,
    Types,
    Tests,
    Conflicts,
    Integration,
    Quality,
    Other,
}

impl FailureCategory {
    /// Classify raw failure output. First match wins; conflicts are
    /// checked first because conflict output often also mentions tests.
    pub fn classify(output: &str) -> Self {
        if CONFLICT_PATTERN.is_match(output) {
            Self::Conflicts
        } else if IMPORT_PATTERN.is_match(output) {
            Self::Imports
        } else if TYPE_PATTERN.is_match(output) {
            Self::Types
        } else if TEST_PATTERN.is_match(output) {
            Self::Tests
        } else if INTEGRATION_PATTERN.is_match(output) {
            Self::Integration
        } else if QUALITY_PATTERN.is_match(output) {
            Self::Quality
        } else {
            Self::Other
        }
    }

    /// Canned remediation guidance attached to new records.
    pub fn default_fix(&self) -> &'static str {
        match self {
            Self::Imports => "verify module paths and declared dependencies before editing",
            Self::Types => "check the expected signatures at the call boundary first",
            Self::Tests => "run the item's test surface locally before reporting completion",
            Self::Conflicts => "rebase on the latest baseline and reconcile both change sets",
            Self::Integration => "confirm dependency items are complete and services reachable",
            Self::Quality => "apply the project formatter and linter before finishing",
            Self::Other => "read the full failure output before retrying",
        }
    }

    /// Relevance boost: which categories matter most for an item kind.
    fn preferred_for(kind: WorkKind) -> &'static [FailureCategory] {
        match kind {
            WorkKind::Test => &[Self::Tests, Self::Imports],
            WorkKind::Integration => &[Self::Integration, Self::Conflicts],
            WorkKind::DataLayer => &[Self::Types, Self::Imports],
            WorkKind::InterfaceLayer => &[Self::Types, Self::Conflicts],
            WorkKind::PresentationLayer => &[Self::Quality, Self::Types],
            WorkKind::Unknown => &[],
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Imports => write!(f, "imports"),
            Self::Types => write!(f, "types"),
            Self::Tests => write!(f, "tests"),
            Self::Conflicts => write!(f, "conflicts"),
            Self::Integration => write!(f, "integration"),
            Self::Quality => write!(f, "quality"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Whether a failure pattern is being seen more or less often lately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Rising,
    Steady,
    Falling,
}

/// Aggregated failure knowledge. Never deleted, only amended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementRecord {
    /// Normalized failure pattern (noise such as line numbers stripped).
    pub pattern: String,
    /// Guidance for avoiding or fixing the failure.
    pub fix: String,
    pub category: FailureCategory,
    pub seen_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub trend: Trend,
    /// Recent sighting timestamps, bounded to the trend window.
    #[serde(default)]
    recent: Vec<DateTime<Utc>>,
}

impl ImprovementRecord {
    fn new(pattern: String, category: FailureCategory) -> Self {
        let now = Utc::now();
        Self {
            pattern,
            fix: category.default_fix().to_string(),
            category,
            seen_count: 1,
            first_seen: now,
            last_seen: now,
            trend: Trend::Steady,
            recent: vec![now],
        }
    }

    fn touch(&mut self) {
        let now = Utc::now();
        self.seen_count += 1;
        self.last_seen = now;
        self.recent.push(now);
        if self.recent.len() > TREND_WINDOW {
            let excess = self.recent.len() - TREND_WINDOW;
            self.recent.drain(..excess);
        }
        self.trend = self.compute_trend();
    }

    /// Compare sighting rates of the newer and older halves of the window.
    fn compute_trend(&self) -> Trend {
        if self.recent.len() < 4 {
            return Trend::Steady;
        }
        let mid = self.recent.len() / 2;
        let older_span = self.recent[mid] - self.recent[0];
        let newer_span = self.recent[self.recent.len() - 1] - self.recent[mid];
        let older = older_span.num_milliseconds().max(1);
        let newer = newer_span.num_milliseconds().max(1);
        // Same number of events in each half: shorter span == higher rate.
        if newer * 2 < older {
            Trend::Rising
        } else if newer > older * 2 {
            Trend::Falling
        } else {
            Trend::Steady
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LearningSnapshot {
    records: HashMap<String, ImprovementRecord>,
}

/// The learning store: upserts on failure, top-N retrieval on dispatch.
pub struct LearningStore {
    inner: RwLock<HashMap<String, ImprovementRecord>>,
    path: Option<PathBuf>,
}

impl LearningStore {
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            path: None,
        }
    }

    pub fn open(path: impl AsRef<Path>) -> DispatchResult<Self> {
        let path = path.as_ref().to_path_buf();
        let records = if path.exists() {
            let bytes = std::fs::read(&path)?;
            serde_json::from_slice::<LearningSnapshot>(&bytes)?.records
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            HashMap::new()
        };
        Ok(Self {
            inner: RwLock::new(records),
            path: Some(path),
        })
    }

    /// Normalize output into a stable one-line pattern.
    fn normalize(output: &str) -> String {
        let line = output
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("unknown failure");
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        NOISE_PATTERN.replace_all(&collapsed, "#").into_owned()
    }

    fn key(pattern: &str) -> String {
        blake3::hash(pattern.as_bytes()).to_hex().to_string()
    }

    /// Upsert a record from raw failure output. Returns the updated record.
    pub fn record_failure(&self, output: &str) -> DispatchResult<ImprovementRecord> {
        let category = FailureCategory::classify(output);
        let pattern = Self::normalize(output);
        let key = Self::key(&pattern);

        let record = {
            let mut inner = self
                .inner
                .write()
                .map_err(|_| DispatchError::Store("learning store lock poisoned".into()))?;
            let record = inner
                .entry(key)
                .and_modify(ImprovementRecord::touch)
                .or_insert_with(|| ImprovementRecord::new(pattern, category));
            record.clone()
        };

        debug!(
            category = %record.category,
            seen = record.seen_count,
            "Recorded failure signature"
        );
        self.persist()?;
        Ok(record)
    }

    /// Top-N records for an item kind: preferred categories first, then
    /// most-seen, then most recent.
    pub fn top_relevant(&self, kind: WorkKind, n: usize) -> Vec<ImprovementRecord> {
        let Ok(inner) = self.inner.read() else {
            return Vec::new();
        };
        let preferred = FailureCategory::preferred_for(kind);
        let mut records: Vec<ImprovementRecord> = inner.values().cloned().collect();
        records.sort_by(|a, b| {
            let boost_a = preferred.contains(&a.category);
            let boost_b = preferred.contains(&b.category);
            boost_b
                .cmp(&boost_a)
                .then(b.seen_count.cmp(&a.seen_count))
                .then(b.last_seen.cmp(&a.last_seen))
        });
        records.truncate(n);
        records
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self) -> DispatchResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let inner = self
            .inner
            .read()
            .map_err(|_| DispatchError::Store("learning store lock poisoned".into()))?;
        let snapshot = LearningSnapshot {
            records: inner.clone(),
        };
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&snapshot)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Render records into the "avoid these known mistakes" brief section.
pub fn render_guidance(records: &[ImprovementRecord]) -> String {
    if records.is_empty() {
        return String::new();
    }
    let mut out = String::from("## Known failure patterns — avoid these\n");
    for record in records {
        out.push_str(&format!(
            "- [{}] seen {}x: {}\n  fix: {}\n",
            record.category, record.seen_count, record.pattern, record.fix
        ));
    }
    out
}
