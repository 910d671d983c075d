//! Master container end-to-end lifecycle tests, driven through in-process
//! capsule loaders and a recording scheduler.

mod support;

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use support::*;
use vantage_plugin_api::{PluginCategory, PluginKey};
use vantage_server::plugin::{ContainerState, MasterError, MasterState};
use vantage_server::{MasterContainer, ServerConfig};

fn test_config(dir: &Path) -> ServerConfig {
    let config = ServerConfig {
        plugin_dir: dir.join("plugins"),
        data_dir: dir.join("data"),
        temp_dir: dir.join("tmp"),
        ..Default::default()
    };
    std::fs::create_dir_all(&config.plugin_dir).unwrap();
    config
}

fn build_master(
    config: ServerConfig,
    loader: Arc<MapLoader>,
    scheduler: Arc<RecordingScheduler>,
) -> Arc<MasterContainer> {
    MasterContainer::builder(config)
        .loader(loader)
        .scheduler(scheduler)
        .build()
}

#[test]
fn test_initialize_loads_and_starts_plugins() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    write_package(&config.plugin_dir, "alpha", &probe_descriptor("alpha", "generic"));
    write_package(&config.plugin_dir, "beta", &probe_descriptor("beta", "alert"));

    let log = new_event_log();
    let loader = Arc::new(MapLoader::default());
    loader.register_probe("alpha", log.clone());
    loader.register_probe("beta", log.clone());
    let master = build_master(config, loader, Arc::new(RecordingScheduler::default()));

    let report = master.initialize().unwrap();
    assert!(report.is_clean(), "problems: {:?}", report.problems);
    assert_eq!(report.loaded.len(), 2);
    assert_eq!(master.state(), MasterState::Started);

    assert_eq!(events_for(&log, "alpha"), vec!["alpha:initialize", "alpha:start"]);
    assert_eq!(events_for(&log, "beta"), vec!["beta:initialize", "beta:start"]);

    let generic = master
        .container_for_category(PluginCategory::Generic)
        .unwrap();
    assert_eq!(generic.state(), ContainerState::Started);
    assert_eq!(generic.plugin_count(), 1);
    assert!(generic.registry().unwrap().is_loaded("alpha"));

    let status = master.status();
    assert_eq!(status.state, "started");
    assert_eq!(status.packages, 2);
    assert_eq!(status.capsules, 2);

    master.shutdown();
}

#[test]
fn test_each_plugin_gets_one_capsule() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    write_package(&config.plugin_dir, "alpha", &probe_descriptor("alpha", "generic"));
    write_package(&config.plugin_dir, "beta", &probe_descriptor("beta", "generic"));

    let log = new_event_log();
    let loader = Arc::new(MapLoader::default());
    loader.register_probe("alpha", log.clone());
    loader.register_probe("beta", log);
    let master = build_master(config, loader.clone(), Arc::new(RecordingScheduler::default()));
    master.initialize().unwrap();

    let manager = master.capsule_manager().unwrap();
    let first = manager.obtain_capsule("alpha").unwrap();
    let again = manager.obtain_capsule("alpha").unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(loader.load_count("alpha"), 1);

    let other = manager.obtain_capsule("beta").unwrap();
    assert!(!Arc::ptr_eq(&first, &other));
    assert_eq!(manager.capsule_count(), 2);

    // Both capsules delegate to the same root.
    assert!(Arc::ptr_eq(first.parent().unwrap(), other.parent().unwrap()));

    master.shutdown();
}

#[test]
fn test_failing_plugin_does_not_affect_siblings() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    for name in ["alpha", "bravo", "charlie"] {
        write_package(&config.plugin_dir, name, &probe_descriptor(name, "generic"));
    }

    let log = new_event_log();
    let loader = Arc::new(MapLoader::default());
    loader.register_probe("alpha", log.clone());
    let bravo = loader.register_probe("bravo", log.clone());
    loader.register_probe("charlie", log.clone());
    bravo.fail_initialize.store(true, Ordering::SeqCst);

    let master = build_master(config, loader, Arc::new(RecordingScheduler::default()));
    let report = master.initialize().unwrap();

    let loaded: Vec<_> = report.loaded.iter().map(|key| key.name.as_str()).collect();
    assert_eq!(loaded, vec!["alpha", "charlie"]);
    let bravo_problems: Vec<_> = report
        .problems
        .iter()
        .filter(|problem| problem.plugin.as_deref() == Some("bravo"))
        .collect();
    assert_eq!(bravo_problems.len(), 1);

    let registry = master
        .container_for_category(PluginCategory::Generic)
        .unwrap()
        .registry()
        .unwrap();
    assert!(!registry.is_loaded("bravo"));
    assert!(registry.is_loaded("alpha"));
    assert_eq!(events_for(&log, "alpha"), vec!["alpha:initialize", "alpha:start"]);
    // bravo got its initialize attempt and nothing else.
    assert_eq!(events_for(&log, "bravo"), vec!["bravo:initialize"]);

    master.shutdown();
}

#[test]
fn test_shutdown_runs_full_lifecycle_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    write_package(&config.plugin_dir, "alpha", &probe_descriptor("alpha", "content"));

    let log = new_event_log();
    let loader = Arc::new(MapLoader::default());
    loader.register_probe("alpha", log.clone());
    let scheduler = Arc::new(RecordingScheduler::default());
    let master = build_master(config, loader, scheduler.clone());

    master.initialize().unwrap();
    master.shutdown();
    assert_eq!(master.state(), MasterState::ShutDown);
    assert!(scheduler.shut_down.load(Ordering::SeqCst));
    assert_eq!(
        events_for(&log, "alpha"),
        vec!["alpha:initialize", "alpha:start", "alpha:stop", "alpha:shutdown"]
    );

    // Idempotent: a second shutdown re-runs nothing.
    master.shutdown();
    assert_eq!(events_for(&log, "alpha").len(), 4);
}

#[test]
fn test_panicking_listener_shutdown_is_contained() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    write_package(&config.plugin_dir, "rowdy", &probe_descriptor("rowdy", "generic"));
    write_package(&config.plugin_dir, "calm", &probe_descriptor("calm", "generic"));

    let log = new_event_log();
    let loader = Arc::new(MapLoader::default());
    let rowdy = loader.register_probe("rowdy", log.clone());
    loader.register_probe("calm", log.clone());
    rowdy.panic_shutdown.store(true, Ordering::SeqCst);

    let master = build_master(config, loader, Arc::new(RecordingScheduler::default()));
    master.initialize().unwrap();
    let manager = master.capsule_manager().unwrap();
    master.shutdown();

    assert_eq!(master.state(), MasterState::ShutDown);
    // The panicking plugin was still removed and its sibling fully cycled.
    assert_eq!(
        events_for(&log, "calm"),
        vec!["calm:initialize", "calm:start", "calm:stop", "calm:shutdown"]
    );
    assert!(log.lock().contains(&"rowdy:shutdown".to_string()));
    assert_eq!(manager.capsule_count(), 0);
}

#[test]
fn test_disabled_plugin_is_inert() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    write_package(&config.plugin_dir, "dormant", &probe_descriptor("dormant", "bundle"));
    let key = PluginKey::new(PluginCategory::Bundle, "dormant");
    config.disabled_plugins = vec![key.clone()];

    let log = new_event_log();
    let loader = Arc::new(MapLoader::default());
    loader.register_probe("dormant", log.clone());
    let master = build_master(config, loader.clone(), Arc::new(RecordingScheduler::default()));

    let report = master.initialize().unwrap();
    assert_eq!(report.disabled, vec![key.clone()]);
    assert!(report.loaded.is_empty());
    assert!(!master.is_plugin_enabled(&key));

    // Nothing plugin-side ever ran: no capsule, no listener callbacks.
    assert_eq!(loader.load_count("dormant"), 0);
    assert!(log.lock().is_empty());
    let registry = master
        .container_for_category(PluginCategory::Bundle)
        .unwrap()
        .registry()
        .unwrap();
    assert!(!registry.is_loaded("dormant"));

    master.shutdown();
}

#[test]
fn test_enable_and_disable_without_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    write_package(&config.plugin_dir, "toggle", &probe_descriptor("toggle", "generic"));
    let key = PluginKey::new(PluginCategory::Generic, "toggle");
    config.disabled_plugins = vec![key.clone()];

    let log = new_event_log();
    let loader = Arc::new(MapLoader::default());
    loader.register_probe("toggle", log.clone());
    let master = build_master(config, loader, Arc::new(RecordingScheduler::default()));
    master.initialize().unwrap();

    master.set_plugin_enabled(&key, true).unwrap();
    assert!(master.is_plugin_enabled(&key));
    assert_eq!(
        events_for(&log, "toggle"),
        vec!["toggle:initialize", "toggle:start"]
    );
    assert!(master.container_for_plugin(&key).is_some());

    master.set_plugin_enabled(&key, false).unwrap();
    assert!(!master.is_plugin_enabled(&key));
    assert!(master.container_for_plugin(&key).is_none());
    assert_eq!(
        events_for(&log, "toggle"),
        vec![
            "toggle:initialize",
            "toggle:start",
            "toggle:stop",
            "toggle:shutdown"
        ]
    );

    // Enabling again builds a fresh listener from the retained package.
    master.set_plugin_enabled(&key, true).unwrap();
    assert_eq!(events_for(&log, "toggle").len(), 6);

    master.shutdown();
}

#[test]
fn test_hot_deploy_after_startup() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let plugin_dir = config.plugin_dir.clone();

    let log = new_event_log();
    let loader = Arc::new(MapLoader::default());
    loader.register_probe("late", log.clone());
    let master = build_master(config, loader, Arc::new(RecordingScheduler::default()));
    master.initialize().unwrap();

    let location = write_package(&plugin_dir, "late", &probe_descriptor("late", "alert"));
    let key = master.load_plugin(&location, true).unwrap();
    assert_eq!(key, PluginKey::new(PluginCategory::Alert, "late"));

    // Loaded into an already-started container, so it starts immediately.
    assert_eq!(events_for(&log, "late"), vec!["late:initialize", "late:start"]);
    assert!(master.container_for_plugin(&key).is_some());

    master.shutdown();
}

#[test]
fn test_invalid_state_operations_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let plugin_dir = config.plugin_dir.clone();
    let master = build_master(
        config,
        Arc::new(MapLoader::default()),
        Arc::new(RecordingScheduler::default()),
    );

    // Nothing but initialize is valid before initialize.
    let err = master.load_plugin(&plugin_dir, true).unwrap_err();
    assert!(matches!(err, MasterError::InvalidState { .. }));
    assert!(master.schedule_all_plugin_jobs().is_err());

    master.initialize().unwrap();
    let err = master.initialize().unwrap_err();
    assert!(matches!(
        err,
        MasterError::InvalidState {
            operation: "initialize",
            ..
        }
    ));

    master.shutdown();
    assert!(master.schedule_all_plugin_jobs().is_err());
}

#[test]
fn test_unparseable_package_is_reported_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    write_package(&config.plugin_dir, "good", &probe_descriptor("good", "generic"));
    write_package(
        &config.plugin_dir,
        "bad",
        "name: ''\ncategory: generic\nversion: 1.0.0\n",
    );

    let log = new_event_log();
    let loader = Arc::new(MapLoader::default());
    loader.register_probe("good", log);
    let master = build_master(config, loader, Arc::new(RecordingScheduler::default()));

    let report = master.initialize().unwrap();
    assert_eq!(report.loaded.len(), 1);
    assert_eq!(report.problems.len(), 1);
    assert!(report.problems[0].plugin.is_none());
    assert_eq!(master.state(), MasterState::Started);

    master.shutdown();
}
