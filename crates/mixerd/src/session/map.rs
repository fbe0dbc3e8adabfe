// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SessionMap — spec §4.7. Resolves mapping targets to sessions and applies
//! volume/mute with the refresh, staleness, and exclusivity guarantees in
//! spec §4.7/§8. Target-resolution and key-normalization rules are pure
//! functions, extracted once per spec §9's design note, and reused by both
//! slider/switch handling and `unmapped_sessions` classification below.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Instant;

use regex::Regex;
use tokio::sync::Mutex;

use super::registry::{RefreshOutcome, SessionHandle, SessionRegistry};
use crate::mapping::Mapping;

// Fixed string literal checked once at startup; see decoder.rs's identical
// pattern-construction precedent for why panicking here is allowed.
#[allow(clippy::panic)]
fn friendly_device_name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^.+ \(.+\)$").unwrap_or_else(|e| panic!("friendly device pattern: {e}"))
    })
}

/// Out-of-scope external collaborator (spec §1: "platform-specific
/// process-window inspection"), narrowed to the one fact `deej.current`
/// needs: the basenames of processes owning the focused window.
pub trait FocusedProcessSource: Send + Sync {
    fn current_focused_process_names(&self) -> Vec<String>;
}

/// Returns the empty set everywhere — spec §9 Open Question: the source
/// returns a stub error silently on platforms without a focus API; this
/// system preserves the empty-set semantics rather than surfacing an error.
pub struct NullFocusedProcessSource;

impl FocusedProcessSource for NullFocusedProcessSource {
    fn current_focused_process_names(&self) -> Vec<String> {
        Vec::new()
    }
}

/// A wrapped [`SessionHandle`] plus the mutable switch-mute bookkeeping from
/// spec §3. `switch_mute_count` is an atomic counter rather than a mutex:
/// the invariant (§8.1) only constrains the *value*, and each session's
/// count is adjusted independently of any other session's, so there's no
/// multi-field critical section to protect.
pub struct Session {
    handle: Arc<dyn SessionHandle>,
    switch_mute_count: AtomicI64,
}

impl Session {
    fn new(handle: Arc<dyn SessionHandle>) -> Self {
        Self { handle, switch_mute_count: AtomicI64::new(0) }
    }

    pub fn key(&self) -> &str {
        self.handle.key()
    }

    pub fn process_path(&self) -> &str {
        self.handle.process_path()
    }

    pub async fn set_volume(&self, percent: f32) -> anyhow::Result<()> {
        self.handle.set_volume(percent).await
    }

    pub async fn get_mute(&self) -> anyhow::Result<bool> {
        self.handle.get_mute().await
    }

    pub async fn set_mute(&self, mute: bool) -> anyhow::Result<()> {
        self.handle.set_mute(mute).await
    }

    async fn release(&self) {
        self.handle.release().await;
    }

    /// Adjust the switch-mute accumulator by `delta`, floored at 0 (spec
    /// §8.boundary: "never goes negative even under repeated off deltas").
    /// Returns the resulting count.
    pub fn adjust_switch_mute_count(&self, delta: i64) -> i64 {
        loop {
            let current = self.switch_mute_count.load(Ordering::SeqCst);
            let next = (current + delta).max(0);
            if self
                .switch_mute_count
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return next;
            }
        }
    }

    pub fn switch_mute_count(&self) -> i64 {
        self.switch_mute_count.load(Ordering::SeqCst)
    }
}

/// True if `target` (already lowercased) is a filesystem-root-rooted path
/// prefix per spec §4.7: drive-letter, UNC, or leading slash.
pub fn is_path_prefix_target(target: &str) -> bool {
    target.starts_with('/')
        || target.starts_with("\\\\")
        || {
            let bytes = target.as_bytes();
            bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
        }
}

/// Case rule per spec §4.7: Windows-style targets (backslash or drive
/// letter) compare case-insensitively, POSIX-style targets case-sensitively.
/// `target` must already be a [`is_path_prefix_target`] path.
fn path_matches(target: &str, process_path: &str) -> bool {
    if process_path.is_empty() {
        return false;
    }
    let windows_style = target.contains('\\') || is_drive_letter_prefix(target);
    let (t, p): (String, String) = if windows_style {
        (target.to_lowercase(), process_path.to_lowercase())
    } else {
        (target.to_owned(), process_path.to_owned())
    };
    let Some(rest) = p.strip_prefix(&t) else {
        return false;
    };
    t.ends_with('/') || t.ends_with('\\') || rest.is_empty() || rest.starts_with(['/', '\\'])
}

fn is_drive_letter_prefix(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// True if `key` is always "mapped" regardless of slider-mapping targets
/// (spec §4.7: master/system/mic and any friendly device name).
fn is_always_mapped_key(key: &str) -> bool {
    matches!(key, "master" | "system" | "mic") || friendly_device_name_pattern().is_match(key)
}

/// Classify `sessions` into the `unmapped_sessions` set per spec §4.7:
/// master/system/mic/friendly-device-name keys are always excluded;
/// everything else is excluded iff some non-special slider-mapping target
/// matches it.
fn compute_unmapped(
    sessions: &[Arc<Session>],
    slider_mapping: &HashMap<u16, Vec<String>>,
) -> Vec<Arc<Session>> {
    let non_special_targets: Vec<String> = slider_mapping
        .values()
        .flatten()
        .map(|t| t.to_lowercase())
        .filter(|t| t != "deej.current" && t != "deej.unmapped")
        .collect();

    sessions
        .iter()
        .filter(|s| {
            let key = s.key().to_lowercase();
            if is_always_mapped_key(&key) {
                return false;
            }
            let mapped = non_special_targets.iter().any(|t| {
                if is_path_prefix_target(t) {
                    path_matches(t, s.process_path())
                } else {
                    *t == key
                }
            });
            !mapped
        })
        .cloned()
        .collect()
}

struct SessionCacheInner {
    by_key: HashMap<String, Vec<Arc<Session>>>,
    unmapped_sessions: Vec<Arc<Session>>,
}

impl Default for SessionCacheInner {
    fn default() -> Self {
        Self { by_key: HashMap::new(), unmapped_sessions: Vec::new() }
    }
}

/// The mapping-rule-to-session-lookup layer, spec §4.7.
pub struct SessionMap {
    registry: Arc<SessionRegistry>,
    focused: Arc<dyn FocusedProcessSource>,
    cache: Mutex<SessionCacheInner>,
    last_refresh: Mutex<Option<Instant>>,
    switch_states: Mutex<HashMap<u16, bool>>,
}

impl SessionMap {
    pub fn new(registry: Arc<SessionRegistry>, focused: Arc<dyn FocusedProcessSource>) -> Self {
        Self {
            registry,
            focused,
            cache: Mutex::new(SessionCacheInner::default()),
            last_refresh: Mutex::new(None),
            switch_states: Mutex::new(HashMap::new()),
        }
    }

    pub async fn last_refresh(&self) -> Option<Instant> {
        *self.last_refresh.lock().await
    }

    async fn is_hard_stale(&self) -> bool {
        self.registry.is_hard_stale().await
    }

    /// Snapshot-replace-and-release refresh (spec §9 design note, §8.3/§8.4
    /// invariants). Returns whether a refresh actually ran (vs. suppressed).
    pub async fn refresh(&self, force: bool, mapping: &Mapping) -> bool {
        let outcome = self.registry.refresh(force).await;
        let handles = match outcome {
            RefreshOutcome::Suppressed => return false,
            RefreshOutcome::Done(Ok(handles)) => handles,
            RefreshOutcome::Done(Err(e)) => {
                tracing::warn!("session refresh failed: {e:#}");
                return false;
            }
        };

        let old_sessions: Vec<Arc<Session>> = {
            let cache = self.cache.lock().await;
            cache.by_key.values().flatten().cloned().collect()
        };
        for s in &old_sessions {
            s.release().await;
        }

        let mut by_key: HashMap<String, Vec<Arc<Session>>> = HashMap::new();
        let mut all: Vec<Arc<Session>> = Vec::new();
        for handle in handles {
            let session = Arc::new(Session::new(handle));
            by_key.entry(session.key().to_lowercase()).or_default().push(Arc::clone(&session));
            all.push(session);
        }

        // Session-added-while-mapped (spec §4.7 last paragraph): seed
        // switch_mute_count from the current switch mapping against known
        // switch states, then mute anything that comes up positive.
        let switch_states = self.switch_states.lock().await.clone();
        for (switch_id, targets) in &mapping.switch_mapping {
            if switch_states.get(switch_id).copied().unwrap_or(false) {
                for s in resolve_in(&by_key, &[], targets, self.focused.as_ref()) {
                    s.adjust_switch_mute_count(1);
                }
            }
        }
        for sessions in by_key.values() {
            for s in sessions {
                if s.switch_mute_count() > 0 {
                    if let Err(e) = s.set_mute(true).await {
                        tracing::warn!(key = s.key(), "failed to mute newly-discovered session: {e:#}");
                    }
                }
            }
        }

        let unmapped = compute_unmapped(&all, &mapping.slider_mapping);

        let mut cache = self.cache.lock().await;
        cache.by_key = by_key;
        cache.unmapped_sessions = unmapped;
        drop(cache);
        *self.last_refresh.lock().await = Some(Instant::now());
        true
    }

    async fn resolve(&self, targets: &[String]) -> Vec<Arc<Session>> {
        let cache = self.cache.lock().await;
        resolve_in(&cache.by_key, &cache.unmapped_sessions, targets, self.focused.as_ref())
    }

    /// Slider-move handling, spec §4.7.
    pub async fn handle_slider_move(&self, slider_id: u16, percent: f32, mapping: &Mapping) {
        if self.is_hard_stale().await {
            self.refresh(true, mapping).await;
        }
        let Some(targets) = mapping.slider_mapping.get(&slider_id) else {
            return;
        };

        let sessions = self.resolve(targets).await;
        if sessions.is_empty() {
            self.refresh(false, mapping).await;
            return;
        }

        let mut any_failed = false;
        for s in &sessions {
            match s.set_volume(percent).await {
                Ok(()) => {
                    if s.switch_mute_count() > 0 {
                        let _ = s.set_mute(true).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(key = s.key(), "set_volume failed: {e:#}");
                    any_failed = true;
                }
            }
        }

        if any_failed {
            self.refresh(true, mapping).await;
        }
    }

    /// Switch-change handling, spec §4.7.
    pub async fn handle_switch_change(
        &self,
        switch_id: u16,
        state: bool,
        prev_state: Option<bool>,
        mapping: &Mapping,
    ) {
        // Refresh-seeding (spec §4.7 "session-added-while-mapped") reads
        // `switch_states` to mute freshly-discovered sessions for switches
        // already on. It must still see the *prior* state here: recording
        // this edge first would make the seeding apply this same +1 that
        // `delta` below also applies, double-counting switch_mute_count.
        if self.is_hard_stale().await {
            self.refresh(true, mapping).await;
        }
        self.switch_states.lock().await.insert(switch_id, state);
        let Some(targets) = mapping.switch_mapping.get(&switch_id) else {
            return;
        };

        let sessions = self.resolve(targets).await;
        if sessions.is_empty() {
            self.refresh(false, mapping).await;
            return;
        }

        let delta: i64 = match (state, prev_state) {
            (true, Some(true)) => 0,
            (true, _) => 1,
            (false, Some(true)) => -1,
            (false, _) => 0,
        };

        let mut any_failed = false;
        for s in &sessions {
            if delta != 0 {
                s.adjust_switch_mute_count(delta);
            }
            let count = s.switch_mute_count();
            if count > 0 {
                match s.get_mute().await {
                    Ok(true) => {}
                    Ok(false) => {
                        if s.set_mute(true).await.is_err() {
                            any_failed = true;
                        }
                    }
                    Err(_) => any_failed = true,
                }
            } else if !state {
                match s.get_mute().await {
                    Ok(true) => {
                        if s.set_mute(false).await.is_err() {
                            any_failed = true;
                        }
                    }
                    Ok(false) => {}
                    Err(_) => any_failed = true,
                }
            }
        }

        if any_failed {
            self.refresh(true, mapping).await;
        }
    }

    #[cfg(test)]
    pub async fn unmapped_keys(&self) -> Vec<String> {
        self.cache.lock().await.unmapped_sessions.iter().map(|s| s.key().to_owned()).collect()
    }
}

/// Resolve `targets` against an already-locked cache snapshot. Free
/// function so both live resolution and the session-added-while-mapped
/// seeding path in [`SessionMap::refresh`] can share it without re-entering
/// the cache mutex.
fn resolve_in(
    by_key: &HashMap<String, Vec<Arc<Session>>>,
    unmapped_sessions: &[Arc<Session>],
    targets: &[String],
    focused: &dyn FocusedProcessSource,
) -> Vec<Arc<Session>> {
    let mut result: Vec<Arc<Session>> = Vec::new();
    let push_unique = |result: &mut Vec<Arc<Session>>, s: &Arc<Session>| {
        if !result.iter().any(|r| Arc::ptr_eq(r, s)) {
            result.push(Arc::clone(s));
        }
    };

    for raw in targets {
        let target = raw.to_lowercase();
        if target == "deej.current" {
            for name in focused.current_focused_process_names() {
                if let Some(list) = by_key.get(&name.to_lowercase()) {
                    for s in list {
                        push_unique(&mut result, s);
                    }
                }
            }
            continue;
        }
        if target == "deej.unmapped" {
            for s in unmapped_sessions {
                push_unique(&mut result, s);
            }
            continue;
        }
        if is_path_prefix_target(&target) {
            for list in by_key.values() {
                for s in list {
                    if path_matches(&target, s.process_path()) {
                        push_unique(&mut result, s);
                    }
                }
            }
            continue;
        }
        if let Some(list) = by_key.get(&target) {
            for s in list {
                push_unique(&mut result, s);
            }
        }
    }
    result
}

#[cfg(test)]
#[path = "map_tests.rs"]
mod tests;
