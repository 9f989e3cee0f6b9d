//! Property-Based Tests for pepinstall
//!
//! These tests verify:
//! - Platform names parse back to the same platform
//! - Placeholder substitution is total over known variables and literal elsewhere
//! - Planning is deterministic and phase-ordered for any selection

use pepinstall::engine::{Phase, ProbeReport};
use pepinstall::platform::InstallDirs;
use pepinstall::{Manifest, PlanRequest, Platform, Variable, VariableMap, plan_install};
use proptest::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use strum::IntoEnumIterator;
use tempfile::TempDir;

// =============================================================================
// Platform Property Tests
// =============================================================================

fn platform_strategy() -> impl Strategy<Value = Platform> {
    prop_oneof![
        Just(Platform::Windows),
        Just(Platform::MacOs),
        Just(Platform::Linux),
    ]
}

proptest! {
    /// Platform: to_string → parse is identity, in any letter case
    #[test]
    fn platform_roundtrip(platform in platform_strategy(), upper in any::<bool>()) {
        let mut name = platform.to_string();
        if upper {
            name = name.to_uppercase();
        }
        prop_assert_eq!(Platform::parse(&name).expect("should parse"), platform);
    }

    /// Platform: anything outside the known names is rejected
    #[test]
    fn platform_rejects_unknown(name in "[a-z]{1,12}") {
        let known = ["windows", "win", "macos", "mac", "osx", "linux", "x11"];
        prop_assume!(!known.contains(&name.as_str()));
        prop_assert!(Platform::parse(&name).is_err());
    }

    /// Platform: executable names only differ by the Windows suffix
    #[test]
    fn executable_name_suffix(platform in platform_strategy(), stem in "[A-Za-z0-9-]{1,16}") {
        let name = platform.executable_name(&stem);
        prop_assert!(name.starts_with(&stem));
        prop_assert_eq!(name.ends_with(".exe"), platform == Platform::Windows);
    }
}

// =============================================================================
// Substitution Property Tests
// =============================================================================

fn full_map() -> VariableMap {
    let mut vars = VariableMap::new();
    for var in Variable::iter() {
        vars.insert(var, format!("<{}>", var));
    }
    vars
}

proptest! {
    /// Text without '@' passes through unchanged
    #[test]
    fn substitute_plain_text_is_identity(text in "[^@]{0,64}") {
        prop_assert_eq!(full_map().substitute(&text).expect("no placeholders"), text);
    }

    /// Every known placeholder is replaced by its value, wherever it appears
    #[test]
    fn substitute_replaces_known(
        prefix in "[a-z/ ]{0,16}",
        suffix in "[a-z/ ]{0,16}",
        index in 0usize..10,
    ) {
        let var = Variable::iter().nth(index % Variable::iter().count()).expect("in range");
        let template = format!("{}{}{}", prefix, var.placeholder(), suffix);
        let expected = format!("{}<{}>{}", prefix, var, suffix);
        prop_assert_eq!(full_map().substitute(&template).expect("known"), expected);
    }

    /// An unset variable is an error, never an empty string
    #[test]
    fn substitute_unset_is_error(index in 0usize..10) {
        let var = Variable::iter().nth(index % Variable::iter().count()).expect("in range");
        let result = VariableMap::new().substitute(&var.placeholder());
        prop_assert!(result.is_err());
    }

    /// Substituted values are not expanded a second time
    #[test]
    fn substitute_is_single_pass(index in 0usize..10) {
        let var = Variable::iter().nth(index % Variable::iter().count()).expect("in range");
        let mut vars = full_map();
        vars.insert(var, "@TargetDir@");
        prop_assert_eq!(vars.substitute(&var.placeholder()).expect("set"), "@TargetDir@");
    }
}

// =============================================================================
// Planner Property Tests
// =============================================================================

struct PlanFixture {
    dir: TempDir,
    manifest: Manifest,
    dirs: InstallDirs,
}

fn plan_fixture(files: &[(String, usize)]) -> PlanFixture {
    let dir = TempDir::new().expect("tempdir");
    for (index, (name, component)) in files.iter().enumerate() {
        let path = dir
            .path()
            .join(format!("packages/c{}/data/{}", component, name));
        fs::create_dir_all(path.parent().expect("parent")).expect("payload dir");
        fs::write(&path, format!("file {}", index)).expect("payload file");
    }
    for component in 0..3 {
        fs::create_dir_all(dir.path().join(format!("packages/c{}/data", component)))
            .expect("payload dir");
    }

    let manifest = Manifest::from_json(
        r#"{
            "name": "Pep9Term",
            "maintenance_tool_name": "Pep9-Updater",
            "components": [
                { "id": "c0", "display_name": "C0", "platforms": ["windows", "macos", "linux"], "payload": "packages/c0/data" },
                { "id": "c1", "display_name": "C1", "platforms": ["windows", "macos", "linux"], "payload": "packages/c1/data" },
                { "id": "c2", "display_name": "C2", "platforms": ["windows", "macos", "linux"], "payload": "packages/c2/data" }
            ]
        }"#,
        dir.path(),
    )
    .expect("manifest");

    let root = dir.path().to_path_buf();
    let dirs = InstallDirs {
        start_menu_dir: root.join("menu"),
        desktop_dir: root.join("desktop"),
        applications_dir: root.join("applications"),
        home_dir: root.join("home"),
    };
    PlanFixture {
        dir,
        manifest,
        dirs,
    }
}

/// Unique relative file names, each owned by one of three components
fn payload_strategy() -> impl Strategy<Value = Vec<(String, usize)>> {
    prop::collection::btree_map("[a-z]{1,6}(/[a-z]{1,6}){0,2}\\.bin", 0usize..3, 0..12)
        .prop_map(|files| files.into_iter().collect())
}

fn selection_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::sample::subsequence(vec!["c0", "c1", "c2"], 1..=3)
        .prop_shuffle()
        .prop_map(|ids| ids.into_iter().map(String::from).collect())
}

fn plan_for(
    fx: &PlanFixture,
    platform: Platform,
    target: &Path,
    components: &[String],
    tool: &Path,
) -> pepinstall::InstallPlan {
    let probes = ProbeReport::new();
    plan_install(&PlanRequest {
        manifest: &fx.manifest,
        platform,
        target,
        components,
        offline: false,
        desktop_shortcut: true,
        dirs: &fx.dirs,
        maintenance_tool_source: Some(tool),
        probes: &probes,
    })
    .expect("plan")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Identical (selection, platform, target) gives identical plans
    #[test]
    fn planning_is_deterministic(
        files in payload_strategy(),
        selection in selection_strategy(),
        platform in platform_strategy(),
    ) {
        let fx = plan_fixture(&files);
        let target = fx.dir.path().join("Pep9Term");
        let tool = fx.dir.path().join("tool");

        let first = plan_for(&fx, platform, &target, &selection, &tool);
        let second = plan_for(&fx, platform, &target, &selection, &tool);
        prop_assert_eq!(&first, &second);

        // Selection order does not matter either
        let mut reversed = selection.clone();
        reversed.reverse();
        let third = plan_for(&fx, platform, &target, &reversed, &tool);
        prop_assert_eq!(&first, &third);
    }

    /// Phases never go backwards, and the target is created first
    #[test]
    fn plan_is_phase_ordered(
        files in payload_strategy(),
        selection in selection_strategy(),
        platform in platform_strategy(),
    ) {
        let fx = plan_fixture(&files);
        let target = fx.dir.path().join("Pep9Term");
        let plan = plan_for(&fx, platform, &target, &selection, &fx.dir.path().join("tool"));

        let phases: Vec<Phase> = plan.operations.iter().map(|p| p.phase).collect();
        prop_assert!(phases.windows(2).all(|w| w[0] <= w[1]));
        prop_assert_eq!(
            plan.operations[0].operation.to_string(),
            format!("CreateDirectory({})", target.display())
        );
    }

    /// Every selected payload file is copied exactly once, into the target
    #[test]
    fn plan_copies_each_selected_file_once(
        files in payload_strategy(),
        selection in selection_strategy(),
    ) {
        let fx = plan_fixture(&files);
        let target = fx.dir.path().join("Pep9Term");
        let plan = plan_for(&fx, Platform::Linux, &target, &selection, &fx.dir.path().join("tool"));

        let mut expected: Vec<PathBuf> = files
            .iter()
            .filter(|(_, component)| selection.contains(&format!("c{}", component)))
            .map(|(name, _)| target.join(name))
            .collect();
        expected.sort();

        let mut copied: Vec<PathBuf> = plan
            .operations
            .iter()
            .filter(|p| p.phase == Phase::Payload)
            .filter_map(|p| p.operation.artifact().map(Path::to_path_buf))
            .collect();
        copied.sort();
        prop_assert_eq!(copied, expected);
    }
}
