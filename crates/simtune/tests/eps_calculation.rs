use std::fs;
use std::path::PathBuf;

use simtune::error::Error;
use simtune::eps::{EpsEngine, EpsOverrides};
use simtune::store::YamlStore;

fn write_module(conf_dir: &PathBuf, module: &str, conf: &str, subs: &[(&str, &str)]) {
    let dir = conf_dir.join(module);
    fs::create_dir_all(&dir).expect("module dir");
    fs::write(dir.join("conf.yml"), conf).expect("module conf");
    for (name, body) in subs {
        fs::write(dir.join(format!("{name}.yml")), body).expect("submodule file");
    }
}

fn setup_tree() -> (tempfile::TempDir, PathBuf) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let conf_dir = tmp.path().join("conf.d");

    // Three submodules summing to 60; only two are referenced by the
    // include list, which must not matter to the engine.
    write_module(
        &conf_dir,
        "Web",
        "enabled: true\nperiod: 1s\nuniquekey:\n  NumUniqKey: 5\nInclude_sub_modules:\n  - alpha\n  - beta\n",
        &[
            ("alpha", "uniquekey:\n  NumUniqKey: 10\n"),
            ("beta", "uniquekey:\n  NumUniqKey: 20\n"),
            ("gamma", "uniquekey:\n  NumUniqKey: 30\n"),
        ],
    );
    // A module whose submodule has no unique key at all.
    write_module(
        &conf_dir,
        "Bare",
        "period: 2s\nInclude_sub_modules: '*'\n",
        &[("plain", "output:\n  kafka:\n    topic: bare-events\n")],
    );
    // A module directory without any submodule files.
    write_module(&conf_dir, "Empty", "uniquekey:\n  NumUniqKey: 3\n", &[]);

    // A stray directory without conf.yml must not show up as a module.
    fs::create_dir_all(conf_dir.join("not-a-module")).expect("stray dir");

    (tmp, conf_dir)
}

#[test]
fn module_listing_requires_conf_yml() {
    let (tmp, conf_dir) = setup_tree();
    let store = YamlStore::new(tmp.path().join("backups"));
    let engine = EpsEngine::new(&conf_dir, &store);
    assert_eq!(engine.list_modules().expect("list"), vec!["Bare", "Empty", "Web"]);
}

#[test]
fn submodule_listing_covers_files_present_not_include_list() {
    let (tmp, conf_dir) = setup_tree();
    let store = YamlStore::new(tmp.path().join("backups"));
    let engine = EpsEngine::new(&conf_dir, &store);
    // gamma exists on disk but is absent from Include_sub_modules; the
    // engine operates over files present.
    assert_eq!(
        engine.list_submodules("Web").expect("list"),
        vec!["alpha", "beta", "gamma"]
    );
    assert!(engine.list_submodules("Missing").expect("list").is_empty());
}

#[test]
fn eps_formula_matches_reference_values() {
    let (tmp, conf_dir) = setup_tree();
    let store = YamlStore::new(tmp.path().join("backups"));
    let engine = EpsEngine::new(&conf_dir, &store);

    let breakdown = engine
        .calculate("Web", &EpsOverrides::default())
        .expect("calculate");
    assert_eq!(breakdown.module_uniquekey, 5);
    assert_eq!(breakdown.total_submodule_contribution, 60);
    assert_eq!(breakdown.period_seconds, 1.0);
    assert_eq!(breakdown.eps, 300.0);
    assert!(breakdown.submodules.iter().all(|s| s.multiplier == 1));

    let slow = engine
        .calculate(
            "Web",
            &EpsOverrides {
                module_period: Some("10s".to_string()),
                ..EpsOverrides::default()
            },
        )
        .expect("calculate with period override");
    assert_eq!(slow.eps, 30.0);
}

#[test]
fn overrides_do_not_touch_files() {
    let (tmp, conf_dir) = setup_tree();
    let store = YamlStore::new(tmp.path().join("backups"));
    let engine = EpsEngine::new(&conf_dir, &store);

    let conf_bytes = fs::read(conf_dir.join("Web/conf.yml")).expect("bytes");
    let mut overrides = EpsOverrides {
        module_uniquekey: Some(100),
        ..EpsOverrides::default()
    };
    overrides.submodule_keys.insert("alpha".to_string(), 1);

    let breakdown = engine.calculate("Web", &overrides).expect("calculate");
    assert_eq!(breakdown.module_uniquekey, 100);
    assert_eq!(breakdown.total_submodule_contribution, 51);
    assert_eq!(fs::read(conf_dir.join("Web/conf.yml")).expect("bytes"), conf_bytes);
}

#[test]
fn missing_submodule_key_falls_back_to_default() {
    let (tmp, conf_dir) = setup_tree();
    let store = YamlStore::new(tmp.path().join("backups"));
    let engine = EpsEngine::new(&conf_dir, &store);

    let breakdown = engine
        .calculate("Bare", &EpsOverrides::default())
        .expect("calculate");
    // plain.yml has no uniquekey section: it contributes the default of 1.
    assert_eq!(breakdown.total_submodule_contribution, 1);
    assert_eq!(breakdown.period_seconds, 2.0);
    assert_eq!(breakdown.eps, 0.5);
}

#[test]
fn zero_period_is_guarded() {
    let (tmp, conf_dir) = setup_tree();
    let store = YamlStore::new(tmp.path().join("backups"));
    let engine = EpsEngine::new(&conf_dir, &store);

    let breakdown = engine
        .calculate(
            "Web",
            &EpsOverrides {
                module_period: Some("0s".to_string()),
                ..EpsOverrides::default()
            },
        )
        .expect("calculate");
    assert_eq!(breakdown.period_seconds, 1.0);
    assert_eq!(breakdown.eps, 300.0);
}

#[test]
fn suggestion_inverts_the_formula() {
    let (tmp, conf_dir) = setup_tree();
    let store = YamlStore::new(tmp.path().join("backups"));
    let engine = EpsEngine::new(&conf_dir, &store);

    let suggestion = engine
        .suggest_unique_key_for_target("Web", 300.0, Some("1s"), 0.05)
        .expect("suggest");
    assert_eq!(suggestion.suggested_module_uniquekey, 5);
    assert_eq!(suggestion.expected_eps, 300.0);
    assert!(suggestion.within_tolerance);
    assert_eq!(suggestion.current_module_uniquekey, 5);

    // An unreachable target still floors the suggestion at 1 and reports
    // the tolerance miss instead of failing.
    let low = engine
        .suggest_unique_key_for_target("Web", 1.0, Some("1s"), 0.05)
        .expect("suggest low");
    assert_eq!(low.suggested_module_uniquekey, 1);
    assert!(!low.within_tolerance);
}

#[test]
fn suggestion_needs_submodule_contribution() {
    let (tmp, conf_dir) = setup_tree();
    let store = YamlStore::new(tmp.path().join("backups"));
    let engine = EpsEngine::new(&conf_dir, &store);

    let err = engine
        .suggest_unique_key_for_target("Empty", 100.0, None, 0.05)
        .unwrap_err();
    assert!(matches!(err, Error::NoUsableSubmodules { .. }));
}

#[test]
fn missing_module_propagates_not_found() {
    let (tmp, conf_dir) = setup_tree();
    let store = YamlStore::new(tmp.path().join("backups"));
    let engine = EpsEngine::new(&conf_dir, &store);
    let err = engine
        .calculate("Ghost", &EpsOverrides::default())
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}
