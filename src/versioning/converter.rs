//! Converter registry with shortest-path conversion chaining.
//!
//! Converters are registered per message type with a source and target
//! version. Path resolution prefers a direct single-step converter whose
//! span covers both endpoints, then falls back to Dijkstra over the
//! multigraph of registered versions with unit edge cost. Resolved paths
//! are cached by (type, from, to); any registration invalidates the cache.

use std::any::Any;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use super::{Result, Version, VersionError};

/// Type-erased payload flowing through a conversion chain.
pub type ConvertPayload = Box<dyn Any + Send>;

/// Conversion function for one registered converter.
pub type ConvertFn = Arc<dyn Fn(ConvertPayload) -> Result<ConvertPayload> + Send + Sync>;

#[derive(Clone)]
struct ConverterEntry {
    from: Version,
    to: Version,
    convert: ConvertFn,
}

impl ConverterEntry {
    /// Whether this converter's span covers both endpoints in its
    /// direction of travel.
    fn covers(&self, from: Version, to: Version) -> bool {
        if self.from <= self.to {
            self.from <= from && from < to && to <= self.to
        } else {
            self.to <= to && to < from && from <= self.from
        }
    }

    fn is_upgrade(&self) -> bool {
        self.from <= self.to
    }

    fn span(&self) -> (Version, Version) {
        if self.is_upgrade() {
            (self.from, self.to)
        } else {
            (self.to, self.from)
        }
    }

    /// Same-direction span intersection with another converter.
    fn overlaps(&self, other: &ConverterEntry) -> bool {
        if self.is_upgrade() != other.is_upgrade() {
            return false;
        }
        let (a_lo, a_hi) = self.span();
        let (b_lo, b_hi) = other.span();
        a_lo < b_hi && b_lo < a_hi
    }
}

/// One hop in a resolved conversion path.
#[derive(Clone)]
pub struct ConversionStep {
    pub from: Version,
    pub to: Version,
    convert: ConvertFn,
}

impl ConversionStep {
    pub fn apply(&self, payload: ConvertPayload) -> Result<ConvertPayload> {
        (self.convert)(payload)
    }
}

impl std::fmt::Debug for ConversionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConversionStep({} -> {})", self.from, self.to)
    }
}

/// Read-only resolved path handed to callers.
#[derive(Debug, Clone)]
pub struct ConversionPath {
    pub message_type: String,
    pub from: Version,
    pub to: Version,
    pub steps: Vec<ConversionStep>,
}

impl ConversionPath {
    /// The empty (identity) path: from == to.
    pub fn is_identity(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run the payload through every step in order.
    pub fn apply(&self, payload: ConvertPayload) -> Result<ConvertPayload> {
        let mut current = payload;
        for step in &self.steps {
            current = step.apply(current)?;
        }
        Ok(current)
    }
}

type PathCacheKey = (String, Version, Version);

/// Registry of message converters plus the resolved-path cache.
#[derive(Default)]
pub struct ConverterRegistry {
    converters: RwLock<HashMap<String, Vec<ConverterEntry>>>,
    cache: RwLock<HashMap<PathCacheKey, Option<Arc<ConversionPath>>>>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a converter for a message type.
    ///
    /// Overlapping registrations are permitted; the overlap is logged so
    /// operators can spot ambiguous coverage.
    pub fn register(
        &self,
        message_type: impl Into<String>,
        from: Version,
        to: Version,
        convert: ConvertFn,
    ) {
        let message_type = message_type.into();
        let mut converters = self.converters.write().expect("converter table poisoned");
        let entries = converters.entry(message_type.clone()).or_default();

        let candidate = ConverterEntry {
            from,
            to,
            convert: convert.clone(),
        };
        if let Some(existing) = entries.iter().find(|e| e.overlaps(&candidate)) {
            warn!(
                message_type = %message_type,
                new_from = %from,
                new_to = %to,
                existing_from = %existing.from,
                existing_to = %existing.to,
                "Overlapping converter registration"
            );
        }

        entries.push(candidate);
        drop(converters);

        // Any registration invalidates resolved paths for the type.
        self.cache
            .write()
            .expect("path cache poisoned")
            .retain(|(cached_type, _, _), _| cached_type != &message_type);
        debug!(message_type = %message_type, from = %from, to = %to, "Converter registered");
    }

    /// Resolve the conversion path for (type, from, to).
    ///
    /// Returns the identity path when from == to, a direct single-step
    /// path when one converter covers both endpoints, otherwise the
    /// shortest chain through registered converters, or `None` when the
    /// versions are unreachable from one another.
    pub fn find_path(
        &self,
        message_type: &str,
        from: Version,
        to: Version,
    ) -> Option<Arc<ConversionPath>> {
        if from == to {
            return Some(Arc::new(ConversionPath {
                message_type: message_type.to_string(),
                from,
                to,
                steps: Vec::new(),
            }));
        }

        let key = (message_type.to_string(), from, to);
        if let Some(cached) = self.cache.read().expect("path cache poisoned").get(&key) {
            return cached.clone();
        }

        let resolved = self.resolve_path(message_type, from, to).map(Arc::new);
        self.cache
            .write()
            .expect("path cache poisoned")
            .insert(key, resolved.clone());
        resolved
    }

    /// Convert a payload between versions, resolving the path first.
    pub fn convert(
        &self,
        message_type: &str,
        from: Version,
        to: Version,
        payload: ConvertPayload,
    ) -> Result<ConvertPayload> {
        let path = self
            .find_path(message_type, from, to)
            .ok_or_else(|| VersionError::NoPath {
                message_type: message_type.to_string(),
                from,
                to,
            })?;
        path.apply(payload)
    }

    fn resolve_path(&self, message_type: &str, from: Version, to: Version) -> Option<ConversionPath> {
        let converters = self.converters.read().expect("converter table poisoned");
        let entries = converters.get(message_type)?;

        // Single-step preference: a converter whose span covers both ends.
        if let Some(direct) = entries
            .iter()
            .find(|e| (e.from == from && e.to == to) || e.covers(from, to))
        {
            return Some(ConversionPath {
                message_type: message_type.to_string(),
                from,
                to,
                steps: vec![ConversionStep {
                    from,
                    to,
                    convert: direct.convert.clone(),
                }],
            });
        }

        // Dijkstra over the multigraph of endpoint versions, unit cost.
        let mut nodes: HashSet<Version> = HashSet::new();
        nodes.insert(from);
        nodes.insert(to);
        for entry in entries {
            nodes.insert(entry.from);
            nodes.insert(entry.to);
        }

        let mut distance: HashMap<Version, u32> = HashMap::new();
        let mut previous: HashMap<Version, (Version, ConverterEntry)> = HashMap::new();
        let mut heap: BinaryHeap<Reverse<(u32, Version)>> = BinaryHeap::new();

        distance.insert(from, 0);
        heap.push(Reverse((0, from)));

        while let Some(Reverse((cost, node))) = heap.pop() {
            if node == to {
                break;
            }
            if cost > *distance.get(&node).unwrap_or(&u32::MAX) {
                continue;
            }
            for entry in entries.iter().filter(|e| e.from == node) {
                let next_cost = cost + 1;
                if next_cost < *distance.get(&entry.to).unwrap_or(&u32::MAX) {
                    distance.insert(entry.to, next_cost);
                    previous.insert(entry.to, (node, entry.clone()));
                    heap.push(Reverse((next_cost, entry.to)));
                }
            }
        }

        if !distance.contains_key(&to) {
            debug!(
                message_type = %message_type,
                from = %from,
                to = %to,
                "No conversion path found"
            );
            return None;
        }

        // Walk back from the target to assemble the chain.
        let mut steps = Vec::new();
        let mut cursor = to;
        while cursor != from {
            let (prev, entry) = previous.get(&cursor)?.clone();
            steps.push(ConversionStep {
                from: entry.from,
                to: entry.to,
                convert: entry.convert,
            });
            cursor = prev;
        }
        steps.reverse();

        Some(ConversionPath {
            message_type: message_type.to_string(),
            from,
            to,
            steps,
        })
    }
}
