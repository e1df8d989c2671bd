//! Integration tests for LampManager
//!
//! Every test drives the mock radio with a paused clock: scan windows,
//! connect timeouts and reconnect backoff elapse instantly.

use pethub_ble::lamp::brightness_to_percent;
use pethub_ble::mock::{MockLampHandle, MockLampSpec, MockLampTransport};
use pethub_ble::uuids::lamp as chars;
use pethub_ble::{CharProps, LampManager, LampManagerConfig, TemperatureBounds};
use pethub_core::{Backoff, ConnectionStatus, Error, LampId};
use pethub_storage::{Blacklist, HubPaths, LampConfigStore};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

const DESK: &str = "AA:BB:CC:00:00:01";
const SHELF: &str = "AA:BB:CC:00:00:02";

fn quiet() -> LampManagerConfig {
    LampManagerConfig::default()
        .scan_window(Duration::from_millis(100))
        .scan_interval(None)
        .poll_interval(None)
}

/// One second between reconnects, no jitter, forever.
fn steady_reconnect() -> Backoff {
    Backoff::new(Duration::from_secs(1), Duration::from_secs(1))
        .with_jitter(Duration::ZERO)
        .unlimited()
}

struct Fixture {
    manager: LampManager,
    handle: MockLampHandle,
    dir: TempDir,
}

impl Fixture {
    fn paths(&self) -> HubPaths {
        HubPaths::new(self.dir.path())
    }
}

async fn fixture(config: LampManagerConfig) -> Fixture {
    let dir = TempDir::new().unwrap();
    let (transport, handle) = MockLampTransport::new();
    let manager = LampManager::open(transport, &HubPaths::new(dir.path()), config)
        .await
        .unwrap();
    Fixture {
        manager,
        handle,
        dir,
    }
}

/// Fixture with one full-featured lamp already discovered and connected.
async fn connected(spec: MockLampSpec, config: LampManagerConfig) -> (Fixture, LampId) {
    let f = fixture(config).await;
    let lamp = f.handle.add(spec).unwrap();
    let report = f.manager.trigger_scan().await.unwrap();
    assert_eq!(report.connected, 1);
    (f, lamp)
}

/// Let the event pump drain.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn test_scan_discovers_and_connects_lamps_only() {
    let f = fixture(quiet()).await;
    let desk = f.handle.add(MockLampSpec::new(DESK, "ELK-BLEDOM")).unwrap();
    f.handle.add(MockLampSpec::other(SHELF, "Pixel 9")).unwrap();

    let report = f.manager.trigger_scan().await.unwrap();
    assert_eq!(report.advertisements, 2);
    assert_eq!(report.new_lamps, 1);
    assert_eq!(report.connect_attempts, 1);
    assert_eq!(report.connected, 1);

    let lamps = f.manager.get_all_lamps();
    assert_eq!(lamps.len(), 1);
    let info = &lamps[0];
    assert_eq!(info.id, desk);
    assert_eq!(info.name, "ELK-BLEDOM");
    assert_eq!(info.status, ConnectionStatus::Connected);
    assert!(info.has_connected_once);
    assert!(info.reachable);
    assert_eq!(info.model.as_deref(), Some("MOCK-LAMP"));
    assert_eq!(info.firmware.as_deref(), Some("1.0.0"));
    assert!(info.capabilities.temperature);
    assert!(info.capabilities.combined_control);

    let stored = LampConfigStore::new(f.paths().lamps).load().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].has_connected_once);
    assert_eq!(stored[0].model.as_deref(), Some("MOCK-LAMP"));
}

#[tokio::test(start_paused = true)]
async fn test_scan_verifies_connected_lamp() {
    let (f, desk) = connected(MockLampSpec::new(DESK, "ELK-BLEDOM"), quiet()).await;
    f.manager.disconnect_lamp(&desk).await.unwrap();
    f.manager.connect_lamp(&desk).await.unwrap();

    let report = f.manager.trigger_scan().await.unwrap();
    assert_eq!(report.new_lamps, 0);
    assert_eq!(report.verified, 1);
    assert_eq!(report.connect_attempts, 0);
    assert_eq!(f.handle.connect_calls(&desk), 2);
}

#[tokio::test(start_paused = true)]
async fn test_never_connected_lamp_is_blacklisted_at_threshold() {
    let config = quiet()
        .blacklist_threshold(3)
        .reconnect(steady_reconnect());
    let f = fixture(config).await;
    let desk = f.handle.add(MockLampSpec::new(DESK, "LEDBLE-1")).unwrap();
    f.handle.fail_next_connects(&desk, 100);

    let report = f.manager.trigger_scan().await.unwrap();
    assert_eq!(report.connected, 0);
    assert_eq!(f.manager.get_lamp(&desk).unwrap().failures, 1);

    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(f.handle.connect_calls(&desk), 3);
    assert!(matches!(
        f.manager.get_lamp(&desk),
        Err(Error::NotFound { .. })
    ));
    assert_eq!(f.manager.get_blacklist(), vec![DESK.to_string()]);

    let persisted = Blacklist::open(f.paths().blacklist).await.unwrap();
    assert!(persisted.contains(DESK));
    let stored = LampConfigStore::new(f.paths().lamps).load().await.unwrap();
    assert!(stored.is_empty());

    let report = f.manager.trigger_scan().await.unwrap();
    assert_eq!(report.ignored, 1);
    assert_eq!(report.new_lamps, 0);
    assert_eq!(f.handle.connect_calls(&desk), 3);
}

#[tokio::test(start_paused = true)]
async fn test_pairing_failures_count_toward_threshold() {
    let config = quiet()
        .blacklist_threshold(2)
        .reconnect(steady_reconnect());
    let f = fixture(config).await;
    let desk = f.handle.add(MockLampSpec::new(DESK, "Neighbour Lamp")).unwrap();
    f.handle.require_pairing(&desk, true);

    f.manager.trigger_scan().await.unwrap();
    let info = f.manager.get_lamp(&desk).unwrap();
    assert!(info.pairing_required);
    assert_eq!(f.manager.get_connection_stats().pairing_required, 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(f.manager.get_lamp(&desk).is_err());
    assert_eq!(f.manager.get_connection_stats().blacklisted, 1);
}

#[tokio::test(start_paused = true)]
async fn test_lamp_that_connected_once_is_never_blacklisted() {
    let config = quiet()
        .blacklist_threshold(2)
        .reconnect(steady_reconnect());
    let (f, desk) = connected(MockLampSpec::new(DESK, "ELK-BLEDOM"), config).await;

    f.handle.set_visible(&desk, false);
    assert!(f.handle.drop_link(&desk));
    settle().await;
    assert_eq!(
        f.manager.get_lamp(&desk).unwrap().status,
        ConnectionStatus::Disconnected
    );

    tokio::time::sleep(Duration::from_secs(20)).await;
    let info = f.manager.get_lamp(&desk).unwrap();
    assert!(info.failures >= 5);
    assert!(info.reconnect_pending);
    assert!(f.manager.get_blacklist().is_empty());

    f.handle.set_visible(&desk, true);
    tokio::time::sleep(Duration::from_secs(2)).await;
    let info = f.manager.get_lamp(&desk).unwrap();
    assert_eq!(info.status, ConnectionStatus::Connected);
    assert_eq!(info.failures, 0);
    assert_eq!(info.reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_blacklist_then_unblacklist() {
    let (f, desk) = connected(MockLampSpec::new(DESK, "ELK-BLEDOM"), quiet()).await;

    let address = f.manager.blacklist_lamp(&desk).await.unwrap();
    assert_eq!(address, DESK);
    assert!(!f.handle.is_connected(&desk));
    assert!(f.manager.get_all_lamps().is_empty());
    assert_eq!(f.manager.get_blacklist(), vec![DESK.to_string()]);

    let report = f.manager.trigger_scan().await.unwrap();
    assert_eq!(report.ignored, 1);
    assert!(f.manager.get_all_lamps().is_empty());

    assert!(f.manager.unblacklist_address("aa:bb:cc:00:00:01").await.unwrap());
    assert!(!f.manager.unblacklist_address(DESK).await.unwrap());

    let report = f.manager.trigger_scan().await.unwrap();
    assert_eq!(report.ignored, 0);
    assert_eq!(report.new_lamps, 1);
    assert_eq!(report.connected, 1);
}

#[tokio::test(start_paused = true)]
async fn test_calibration_finds_warm_limit_and_restores() {
    let spec = MockLampSpec::new(DESK, "ELK-BLEDOM").warm_limit(60);
    let (f, desk) = connected(spec, quiet()).await;

    let info = f.manager.get_lamp(&desk).unwrap();
    assert_eq!(
        info.temperature_bounds,
        Some(TemperatureBounds {
            warm_raw: 60,
            cool_raw: 255
        })
    );
    assert_eq!(info.state.temperature, Some(100));
    assert_eq!(f.handle.value(&desk, chars::TEMPERATURE), Some(vec![255]));
    assert_eq!(
        f.handle.writes(&desk),
        vec![(chars::TEMPERATURE, vec![0]), (chars::TEMPERATURE, vec![255])]
    );

    let state = f.manager.set_temperature(&desk, 1).await.unwrap();
    assert_eq!(state.temperature, Some(1));
    assert_eq!(f.handle.value(&desk, chars::TEMPERATURE), Some(vec![60]));
    assert_eq!(
        f.handle.writes(&desk).last(),
        Some(&(chars::CONTROL, vec![0xA5, 0, 255, 60]))
    );
}

#[tokio::test(start_paused = true)]
async fn test_calibration_runs_once_per_lamp() {
    let (f, desk) = connected(MockLampSpec::new(DESK, "ELK-BLEDOM"), quiet()).await;
    f.manager.disconnect_lamp(&desk).await.unwrap();
    f.manager.connect_lamp(&desk).await.unwrap();

    let calibration_writes = f
        .handle
        .writes(&desk)
        .iter()
        .filter(|(uuid, value)| *uuid == chars::TEMPERATURE && value == &vec![0])
        .count();
    assert_eq!(calibration_writes, 1);
}

#[tokio::test(start_paused = true)]
async fn test_combined_control_is_preferred() {
    let (f, desk) = connected(MockLampSpec::new(DESK, "ELK-BLEDOM"), quiet()).await;
    let before = f.handle.writes(&desk).len();

    let state = f.manager.set_lamp_state(&desk, true, Some(50)).await.unwrap();
    assert!(state.is_on);
    assert_eq!(state.brightness, 50);

    let writes = f.handle.writes(&desk);
    assert_eq!(writes.len(), before + 1);
    assert_eq!(writes[before], (chars::CONTROL, vec![0xA5, 1, 127, 255]));
}

#[tokio::test(start_paused = true)]
async fn test_separate_writes_without_control_characteristic() {
    let spec = MockLampSpec::new(DESK, "ELK-BLEDOM").without_control();
    let (f, desk) = connected(spec, quiet()).await;
    let before = f.handle.writes(&desk).len();

    f.manager.set_lamp_state(&desk, true, Some(50)).await.unwrap();
    assert_eq!(
        f.handle.writes(&desk)[before..],
        [(chars::POWER, vec![1]), (chars::BRIGHTNESS, vec![127])]
    );

    f.manager.set_power(&desk, false).await.unwrap();
    assert_eq!(f.handle.value(&desk, chars::POWER), Some(vec![0]));
    assert_eq!(f.handle.value(&desk, chars::BRIGHTNESS), Some(vec![127]));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_and_unsupported_commands() {
    let spec = MockLampSpec::new(DESK, "ELK-BLEDOM").without_temperature();
    let (f, desk) = connected(spec, quiet()).await;
    let writes = f.handle.writes(&desk).len();

    assert!(matches!(
        f.manager.set_brightness(&desk, 0).await,
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        f.manager.set_brightness(&desk, 101).await,
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        f.manager.set_temperature(&desk, 50).await,
        Err(Error::Unsupported { .. })
    ));
    assert!(matches!(
        f.manager.set_power(&LampId::new("FF:FF").unwrap(), true).await,
        Err(Error::NotFound { .. })
    ));
    assert_eq!(f.handle.writes(&desk).len(), writes);
    assert_eq!(f.manager.get_lamp(&desk).unwrap().state.temperature, None);
}

#[tokio::test(start_paused = true)]
async fn test_failed_write_drops_stale_link_and_reconnects() {
    let (f, desk) = connected(MockLampSpec::new(DESK, "ELK-BLEDOM"), quiet()).await;
    f.handle.fail_next_writes(&desk, 1);

    let err = f.manager.set_power(&desk, true).await.unwrap_err();
    assert!(matches!(err, Error::CommandFailed { .. }));
    let info = f.manager.get_lamp(&desk).unwrap();
    assert_eq!(info.status, ConnectionStatus::Disconnected);
    assert!(info.reconnect_pending);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(
        f.manager.get_lamp(&desk).unwrap().status,
        ConnectionStatus::Connected
    );
    assert_eq!(f.handle.connect_calls(&desk), 2);

    let state = f.manager.set_power(&desk, true).await.unwrap();
    assert!(state.is_on);
}

#[tokio::test(start_paused = true)]
async fn test_command_connects_disconnected_lamp() {
    let (f, desk) = connected(MockLampSpec::new(DESK, "ELK-BLEDOM"), quiet()).await;
    f.manager.disconnect_lamp(&desk).await.unwrap();

    f.manager.set_power(&desk, true).await.unwrap();
    assert!(f.handle.is_connected(&desk));
    assert_eq!(f.handle.connect_calls(&desk), 2);
}

#[tokio::test(start_paused = true)]
async fn test_rename_persists_and_writes_name() {
    let (f, desk) = connected(MockLampSpec::new(DESK, "ELK-BLEDOM"), quiet()).await;

    let info = f.manager.rename_lamp(&desk, "  Desk  ").await.unwrap();
    assert_eq!(info.name, "Desk");
    assert_eq!(
        f.handle.value(&desk, chars::DEVICE_NAME),
        Some(b"Desk".to_vec())
    );

    let stored = LampConfigStore::new(f.paths().lamps).load().await.unwrap();
    assert_eq!(stored[0].name, "Desk");

    assert!(matches!(
        f.manager.rename_lamp(&desk, "   ").await,
        Err(Error::Validation(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_rename_disconnected_lamp_only_persists() {
    let (f, desk) = connected(MockLampSpec::new(DESK, "ELK-BLEDOM"), quiet()).await;
    f.manager.disconnect_lamp(&desk).await.unwrap();

    f.manager.rename_lamp(&desk, "Shelf").await.unwrap();
    assert_eq!(
        f.handle.value(&desk, chars::DEVICE_NAME),
        Some(b"ELK-BLEDOM".to_vec())
    );
    assert_eq!(f.manager.get_lamp(&desk).unwrap().name, "Shelf");
}

#[tokio::test(start_paused = true)]
async fn test_pairing_flag_clears_after_successful_connect() {
    let f = fixture(quiet()).await;
    let desk = f.handle.add(MockLampSpec::new(DESK, "ELK-BLEDOM")).unwrap();
    f.handle.require_pairing(&desk, true);

    f.manager.trigger_scan().await.unwrap();
    let err = f.manager.connect_lamp(&desk).await.unwrap_err();
    assert!(err.is_authorization());
    assert!(f.manager.get_lamp(&desk).unwrap().pairing_required);

    f.handle.require_pairing(&desk, false);
    f.manager.connect_lamp(&desk).await.unwrap();
    let info = f.manager.get_lamp(&desk).unwrap();
    assert!(!info.pairing_required);
    assert_eq!(info.failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_manual_disconnect_suppresses_reconnect() {
    let (f, desk) = connected(MockLampSpec::new(DESK, "ELK-BLEDOM"), quiet()).await;

    f.manager.disconnect_lamp(&desk).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    let info = f.manager.get_lamp(&desk).unwrap();
    assert_eq!(info.status, ConnectionStatus::Disconnected);
    assert!(!info.reconnect_pending);
    assert_eq!(f.handle.connect_calls(&desk), 1);

    let report = f.manager.trigger_scan().await.unwrap();
    assert_eq!(report.connect_attempts, 0);

    f.manager.connect_lamp(&desk).await.unwrap();
    assert_eq!(
        f.manager.get_lamp(&desk).unwrap().status,
        ConnectionStatus::Connected
    );
}

#[tokio::test(start_paused = true)]
async fn test_remote_press_updates_state_through_notification() {
    let (f, desk) = connected(MockLampSpec::new(DESK, "ELK-BLEDOM"), quiet()).await;
    assert!(!f.manager.get_lamp(&desk).unwrap().state.is_on);

    assert!(f.handle.press_remote(&desk, true, 1));
    settle().await;

    let state = f.manager.get_lamp(&desk).unwrap().state;
    assert!(state.is_on);
    assert_eq!(state.brightness, 1);
}

#[tokio::test(start_paused = true)]
async fn test_scan_drops_unresponsive_lamp() {
    let config = quiet().auto_connect(false);
    let f = fixture(config).await;
    let desk = f.handle.add(MockLampSpec::new(DESK, "ELK-BLEDOM")).unwrap();
    let shelf = f.handle.add(MockLampSpec::new(SHELF, "ELK-BLEDOM")).unwrap();
    f.manager.trigger_scan().await.unwrap();
    f.manager.connect_all_lamps().await;

    f.handle.stall_reads(&desk, true);
    let report = f.manager.trigger_scan().await.unwrap();
    assert_eq!(report.verified, 1);
    assert_eq!(report.dropped, 1);
    assert_eq!(
        f.manager.get_lamp(&desk).unwrap().status,
        ConnectionStatus::Disconnected
    );
    assert_eq!(
        f.manager.get_lamp(&shelf).unwrap().status,
        ConnectionStatus::Connected
    );
}

#[tokio::test(start_paused = true)]
async fn test_hidden_lamp_becomes_unreachable() {
    let config = quiet().auto_connect(false);
    let f = fixture(config).await;
    let desk = f.handle.add(MockLampSpec::new(DESK, "ELK-BLEDOM")).unwrap();
    f.manager.trigger_scan().await.unwrap();
    assert!(f.manager.get_lamp(&desk).unwrap().reachable);

    f.handle.set_visible(&desk, false);
    f.manager.trigger_scan().await.unwrap();
    assert!(!f.manager.get_lamp(&desk).unwrap().reachable);
    assert_eq!(f.manager.get_connection_stats().reachable, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_connect_is_bounded() {
    let config = quiet().auto_connect(false);
    let f = fixture(config).await;
    let desk = f.handle.add(MockLampSpec::new(DESK, "ELK-BLEDOM")).unwrap();
    f.manager.trigger_scan().await.unwrap();
    f.handle.stall_connects(&desk, true);

    let started = Instant::now();
    let err = f.manager.connect_lamp(&desk).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, Error::ConnectionTimeout { .. }));
    assert!(elapsed >= Duration::from_secs(15));
    assert!(elapsed < Duration::from_secs(16));
    assert_eq!(
        f.manager.get_lamp(&desk).unwrap().status,
        ConnectionStatus::Disconnected
    );
}

#[tokio::test(start_paused = true)]
async fn test_connect_budget_covers_link_preparation() {
    let config = quiet()
        .auto_connect(false)
        .connect_timeout(Duration::from_secs(3));
    let f = fixture(config).await;
    let desk = f.handle.add(MockLampSpec::new(DESK, "ELK-BLEDOM")).unwrap();
    f.manager.trigger_scan().await.unwrap();
    // Every step fits io_timeout, the sum does not fit connect_timeout.
    f.handle.set_latency(Duration::from_millis(600));

    let started = Instant::now();
    let err = f.manager.connect_lamp(&desk).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, Error::ConnectionTimeout { .. }));
    assert!(elapsed >= Duration::from_secs(3));
    assert!(elapsed < Duration::from_millis(3100));
    assert_eq!(
        f.manager.get_lamp(&desk).unwrap().status,
        ConnectionStatus::Disconnected
    );
}

#[tokio::test(start_paused = true)]
async fn test_lamp_with_write_only_control_connects_and_verifies() {
    let config = quiet().blacklist_threshold(1);
    let spec = MockLampSpec::new(DESK, "ELK-BLEDOM")
        .props(chars::CONTROL, CharProps::WRITE_ONLY)
        .props(chars::STATE, CharProps::READ_ONLY)
        .props(chars::POWER, CharProps::WRITE_ONLY)
        .props(chars::BRIGHTNESS, CharProps::WRITE_ONLY);
    let (f, desk) = connected(spec, config).await;

    let info = f.manager.get_lamp(&desk).unwrap();
    assert_eq!(info.status, ConnectionStatus::Connected);
    assert!(info.capabilities.combined_control);
    assert_eq!(f.handle.connect_calls(&desk), 1);
    assert!(f.manager.get_blacklist().is_empty());

    f.manager.set_lamp_state(&desk, true, Some(50)).await.unwrap();
    assert_eq!(
        f.handle.writes(&desk).last(),
        Some(&(chars::CONTROL, vec![0xA5, 1, 127, 255]))
    );

    for _ in 0..3 {
        let report = f.manager.trigger_scan().await.unwrap();
        assert_eq!(report.verified, 1);
        assert_eq!(report.dropped, 0);
    }
    assert_eq!(f.handle.connect_calls(&desk), 1);

    // Nothing is subscribed, so remote changes only show up on reads.
    assert!(!f.handle.press_remote(&desk, false, 1));
    settle().await;
    assert!(f.manager.get_lamp(&desk).unwrap().state.is_on);
    let state = f.manager.refresh_lamp_state(&desk).await.unwrap();
    assert!(!state.is_on);
    assert_eq!(state.brightness, 1);
}

#[tokio::test(start_paused = true)]
async fn test_poll_loop_refreshes_state() {
    let config = quiet().poll_interval(Some(Duration::from_secs(30)));
    let (f, desk) = connected(MockLampSpec::new(DESK, "ELK-BLEDOM"), config).await;

    f.handle.set_state(&desk, true, 100);
    settle().await;
    assert!(!f.manager.get_lamp(&desk).unwrap().state.is_on);

    tokio::time::sleep(Duration::from_secs(31)).await;
    let state = f.manager.get_lamp(&desk).unwrap().state;
    assert!(state.is_on);
    assert_eq!(state.brightness, brightness_to_percent(100));
}

#[tokio::test(start_paused = true)]
async fn test_notification_from_unknown_characteristic_is_ignored() {
    let (f, desk) = connected(MockLampSpec::new(DESK, "ELK-BLEDOM"), quiet()).await;
    let before = f.manager.get_lamp(&desk).unwrap().state;

    assert!(f.handle.notify(&desk, chars::STATE, vec![0x00, 0x01]));
    assert!(f.handle.notify(&desk, chars::DEVICE_NAME, b"hello".to_vec()));
    settle().await;

    assert_eq!(f.manager.get_lamp(&desk).unwrap().state, before);
}

#[tokio::test(start_paused = true)]
async fn test_configs_survive_restart() {
    let (f, desk) = connected(MockLampSpec::new(DESK, "ELK-BLEDOM"), quiet()).await;
    f.manager.rename_lamp(&desk, "Desk").await.unwrap();
    f.manager.shutdown().await;

    let (transport, _handle) = MockLampTransport::new();
    let restarted = LampManager::open(transport, &f.paths(), quiet()).await.unwrap();
    let info = restarted.get_lamp(&desk).unwrap();
    assert_eq!(info.name, "Desk");
    assert!(info.has_connected_once);
    assert_eq!(info.status, ConnectionStatus::Disconnected);
    restarted.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_connection_stats() {
    let config = quiet().auto_connect(false);
    let f = fixture(config).await;
    let desk = f.handle.add(MockLampSpec::new(DESK, "ELK-BLEDOM")).unwrap();
    f.handle.add(MockLampSpec::new(SHELF, "Bedside Lamp")).unwrap();
    f.manager.trigger_scan().await.unwrap();
    f.manager.connect_lamp(&desk).await.unwrap();

    let stats = f.manager.get_connection_stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.connected, 1);
    assert_eq!(stats.disconnected, 1);
    assert_eq!(stats.reachable, 2);
    assert_eq!(stats.blacklisted, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_links_and_refuses_work() {
    let (f, desk) = connected(MockLampSpec::new(DESK, "ELK-BLEDOM"), quiet()).await;

    f.manager.shutdown().await;
    f.manager.shutdown().await;

    assert!(f.manager.is_shutting_down());
    assert!(!f.handle.is_connected(&desk));
    assert!(matches!(
        f.manager.set_power(&desk, true).await,
        Err(Error::ShuttingDown)
    ));
    assert!(matches!(
        f.manager.trigger_scan().await,
        Err(Error::ShuttingDown)
    ));

    f.handle.drop_link(&desk);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(f.handle.connect_calls(&desk), 1);
}
