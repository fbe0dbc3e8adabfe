// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::*;
use crate::mapping::Mapping;

struct FakeSession {
    key: String,
    process_path: String,
    muted: AtomicBool,
    volume: std::sync::Mutex<f32>,
    fail_set_volume: AtomicBool,
}

impl FakeSession {
    fn new(key: &str, process_path: &str) -> Arc<Self> {
        Arc::new(Self {
            key: key.to_owned(),
            process_path: process_path.to_owned(),
            muted: AtomicBool::new(false),
            volume: std::sync::Mutex::new(0.0),
            fail_set_volume: AtomicBool::new(false),
        })
    }

    fn volume(&self) -> f32 {
        *self.volume.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SessionHandle for FakeSession {
    fn key(&self) -> &str {
        &self.key
    }
    fn process_path(&self) -> &str {
        &self.process_path
    }
    async fn get_volume(&self) -> anyhow::Result<f32> {
        Ok(self.volume())
    }
    async fn set_volume(&self, percent: f32) -> anyhow::Result<()> {
        if self.fail_set_volume.load(Ordering::SeqCst) {
            anyhow::bail!("stale session handle");
        }
        *self.volume.lock().unwrap_or_else(|e| e.into_inner()) = percent;
        Ok(())
    }
    async fn get_mute(&self) -> anyhow::Result<bool> {
        Ok(self.muted.load(Ordering::SeqCst))
    }
    async fn set_mute(&self, mute: bool) -> anyhow::Result<()> {
        self.muted.store(mute, Ordering::SeqCst);
        Ok(())
    }
    async fn release(&self) {}
}

async fn map_with_sessions(sessions: Vec<Arc<FakeSession>>) -> SessionMap {
    let backend = Arc::new(NullAudioBackend::new());
    let handles: Vec<Arc<dyn SessionHandle>> =
        sessions.into_iter().map(|s| s as Arc<dyn SessionHandle>).collect();
    backend.set_sessions(handles).await;
    let registry = Arc::new(SessionRegistry::new(backend));
    let map = SessionMap::new(registry, Arc::new(NullFocusedProcessSource));
    map.refresh(true, &Mapping::default()).await;
    map
}

// Scenario A — slider maps to a running process.
#[tokio::test]
async fn slider_move_sets_volume_on_mapped_session() {
    let firefox = FakeSession::new("firefox", "/usr/bin/firefox");
    let map = map_with_sessions(vec![Arc::clone(&firefox)]).await;

    let mut mapping = Mapping::default();
    mapping.slider_mapping.insert(3, vec!["firefox".into()]);

    map.handle_slider_move(3, 0.42, &mapping).await;
    assert!((firefox.volume() - 0.42).abs() < 1e-6);
}

#[tokio::test]
async fn slider_move_reasserts_mute_when_switch_mute_count_positive() {
    let discord = FakeSession::new("discord", "");
    let map = map_with_sessions(vec![Arc::clone(&discord)]).await;

    let mut mapping = Mapping::default();
    mapping.slider_mapping.insert(0, vec!["discord".into()]);

    // Simulate an active switch-mute hold.
    {
        let cache = map.cache.lock().await;
        let session = &cache.by_key.get("discord").unwrap()[0];
        session.adjust_switch_mute_count(1);
    }

    map.handle_slider_move(0, 0.9, &mapping).await;
    assert!(discord.get_mute().await.unwrap());
}

#[tokio::test]
async fn slider_move_with_no_mapping_is_a_no_op() {
    let map = map_with_sessions(vec![]).await;
    map.handle_slider_move(99, 0.5, &Mapping::default()).await;
}

// Scenario B — mute via switch accumulates.
#[tokio::test]
async fn switch_mute_accumulates_and_drains() {
    let discord = FakeSession::new("discord", "");
    let map = map_with_sessions(vec![Arc::clone(&discord)]).await;

    let mut mapping = Mapping::default();
    mapping.switch_mapping.insert(0, vec!["discord".into()]);
    mapping.switch_mapping.insert(1, vec!["discord".into()]);

    map.handle_switch_change(0, true, None, &mapping).await;
    map.handle_switch_change(1, true, None, &mapping).await;
    map.handle_switch_change(0, false, Some(true), &mapping).await;

    let count = {
        let cache = map.cache.lock().await;
        cache.by_key.get("discord").unwrap()[0].switch_mute_count()
    };
    assert_eq!(count, 1);
    assert!(discord.get_mute().await.unwrap());

    map.handle_switch_change(1, false, Some(true), &mapping).await;
    let count = {
        let cache = map.cache.lock().await;
        cache.by_key.get("discord").unwrap()[0].switch_mute_count()
    };
    assert_eq!(count, 0);
    assert!(!discord.get_mute().await.unwrap());
}

#[tokio::test]
async fn switch_mute_count_never_goes_negative() {
    let discord = FakeSession::new("discord", "");
    let map = map_with_sessions(vec![Arc::clone(&discord)]).await;
    let mut mapping = Mapping::default();
    mapping.switch_mapping.insert(0, vec!["discord".into()]);

    map.handle_switch_change(0, false, None, &mapping).await;
    map.handle_switch_change(0, false, Some(false), &mapping).await;

    let count = {
        let cache = map.cache.lock().await;
        cache.by_key.get("discord").unwrap()[0].switch_mute_count()
    };
    assert_eq!(count, 0);
}

// Regression for the session-added-while-mapped seeding interacting with a
// hard-stale forced refresh on the very event that turns a switch on: the
// switch's new state must not be recorded until after the refresh runs, or
// the seeding pass (which reads switch_states) and the event's own `delta`
// both apply the same +1 to the freshly rebuilt session.
#[tokio::test(start_paused = true)]
async fn switch_on_during_hard_stale_refresh_counts_mute_once() {
    let discord = FakeSession::new("discord", "");
    let map = map_with_sessions(vec![Arc::clone(&discord)]).await;

    let mut mapping = Mapping::default();
    mapping.switch_mapping.insert(0, vec!["discord".into()]);

    tokio::time::advance(
        crate::session::registry::HARD_MAX_REFRESH_INTERVAL + std::time::Duration::from_secs(1),
    )
    .await;

    // This switch-change both forces a refresh (cache is hard-stale) and
    // is itself the first "on" edge for switch 0.
    map.handle_switch_change(0, true, None, &mapping).await;

    let count = {
        let cache = map.cache.lock().await;
        cache.by_key.get("discord").unwrap()[0].switch_mute_count()
    };
    assert_eq!(count, 1, "the on-edge must only be counted once, not by both seeding and delta");
    assert!(discord.get_mute().await.unwrap());
}

#[tokio::test]
async fn failed_set_volume_forces_refresh_on_next_call() {
    let flaky = FakeSession::new("flaky", "");
    flaky.fail_set_volume.store(true, Ordering::SeqCst);
    let map = map_with_sessions(vec![Arc::clone(&flaky)]).await;

    let mut mapping = Mapping::default();
    mapping.slider_mapping.insert(0, vec!["flaky".into()]);

    let before = map.last_refresh().await.expect("initial refresh recorded");
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    map.handle_slider_move(0, 0.1, &mapping).await;
    let after = map.last_refresh().await.expect("refresh recorded");
    assert!(after > before, "a forced refresh should follow a failed set_volume");
}

#[test]
fn path_prefix_target_detection() {
    assert!(is_path_prefix_target("/usr/bin/firefox"));
    assert!(is_path_prefix_target("c:\\program files\\spotify"));
    assert!(is_path_prefix_target("\\\\server\\share\\app.exe"));
    assert!(!is_path_prefix_target("firefox"));
    assert!(!is_path_prefix_target("deej.current"));
}

#[tokio::test]
async fn path_prefix_target_matches_case_insensitively_on_windows_style() {
    let spotify = FakeSession::new("spotify", "C:\\Program Files\\Spotify\\spotify.exe");
    let map = map_with_sessions(vec![Arc::clone(&spotify)]).await;

    let mut mapping = Mapping::default();
    mapping.slider_mapping.insert(0, vec!["c:\\program files\\spotify".into()]);

    map.handle_slider_move(0, 0.7, &mapping).await;
    assert!((spotify.volume() - 0.7).abs() < 1e-6);
}

#[tokio::test]
async fn unmapped_sessions_excludes_master_system_mic_and_friendly_names() {
    let master = FakeSession::new("master", "");
    let mic = FakeSession::new("mic", "");
    let device = FakeSession::new("Speakers (Realtek)", "");
    let other = FakeSession::new("randomapp", "");
    let map = map_with_sessions(vec![
        Arc::clone(&master),
        Arc::clone(&mic),
        Arc::clone(&device),
        Arc::clone(&other),
    ])
    .await;

    let keys = map.unmapped_keys().await;
    assert!(!keys.iter().any(|k| k.eq_ignore_ascii_case("master")));
    assert!(!keys.iter().any(|k| k.eq_ignore_ascii_case("mic")));
    assert!(!keys.contains(&"Speakers (Realtek)".to_string()));
    assert!(keys.contains(&"randomapp".to_string()));
}

#[tokio::test]
async fn deej_unmapped_target_resolves_to_unmapped_sessions() {
    let mapped = FakeSession::new("firefox", "");
    let unmapped = FakeSession::new("randomapp", "");
    let map = map_with_sessions(vec![Arc::clone(&mapped), Arc::clone(&unmapped)]).await;

    let mut mapping = Mapping::default();
    mapping.slider_mapping.insert(0, vec!["firefox".into()]);
    mapping.slider_mapping.insert(1, vec!["deej.unmapped".into()]);

    map.handle_slider_move(1, 0.3, &mapping).await;
    assert!((unmapped.volume() - 0.3).abs() < 1e-6);
}
