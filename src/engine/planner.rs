//! Operation Planner
//!
//! Translates a component selection into an ordered sequence of
//! [`Operation`]s that the executor can apply.
//!
//! # Phases
//!
//! | Phase            | Operations Generated |
//! |------------------|---------------------|
//! | Directories      | CreateDirectory for the target and every payload sub-directory |
//! | Payload          | CopyFile for every payload file (sorted walk) |
//! | Prerequisites    | RunExecutable for each required prerequisite the probes found missing |
//! | MaintenanceTool  | CopyFile of the maintenance tool into the target |
//! | Integration      | Launcher for the platform (shortcuts / desktop entry / app link) |
//! | PostInstall      | Component operation templates |
//!
//! # Design
//!
//! - **No side effects**: reads the payload listing, writes nothing
//! - **Deterministic**: same inputs, same plan, same order
//! - **Fail fast**: unknown components and unresolved placeholders are
//!   reported before anything touches the disk
//!
//! # What This Explicitly Refuses To Do
//!
//! - Run probes (the caller hands in a [`ProbeReport`])
//! - Let two components install the same file

use crate::engine::operation::{Operation, Phase};
use crate::error::{InstallError, Result};
use crate::platform::InstallDirs;
use crate::process::CommandSpec;
use crate::registry::{CommandTemplate, Manifest, TemplateKind};
use crate::types::{LauncherStrategy, Platform};
use crate::variables::VariableMap;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

// ============================================================================
// Inputs
// ============================================================================

/// Result of probing prerequisites: id → present on this machine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeReport {
    present: BTreeMap<String, bool>,
}

impl ProbeReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, id: impl Into<String>, present: bool) {
        self.present.insert(id.into(), present);
    }

    /// Unprobed prerequisites count as missing.
    pub fn is_present(&self, id: &str) -> bool {
        self.present.get(id).copied().unwrap_or(false)
    }
}

/// Everything the planner needs to know about one install session
#[derive(Debug, Clone)]
pub struct PlanRequest<'a> {
    pub manifest: &'a Manifest,
    pub platform: Platform,
    pub target: &'a Path,
    /// Selected component ids
    pub components: &'a [String],
    pub offline: bool,
    pub desktop_shortcut: bool,
    pub dirs: &'a InstallDirs,
    /// Binary installed as the maintenance tool, if known
    pub maintenance_tool_source: Option<&'a Path>,
    pub probes: &'a ProbeReport,
}

// ============================================================================
// Plan
// ============================================================================

/// One operation with the phase it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedOperation {
    pub phase: Phase,
    pub operation: Operation,
}

/// The complete, ordered install plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    pub target: PathBuf,
    pub platform: Platform,
    /// Selected components that apply to `platform`, in manifest order
    pub components: Vec<String>,
    pub operations: Vec<PlannedOperation>,
}

impl InstallPlan {
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Number of operations in `phase`
    pub fn count(&self, phase: Phase) -> usize {
        self.operations.iter().filter(|op| op.phase == phase).count()
    }

    /// Human-readable summary for `plan` output and confirmation pages
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "Install plan for {} ({}): {} operation(s)",
            self.target.display(),
            self.platform,
            self.len()
        )];
        lines.push(format!("Components: {}", self.components.join(", ")));
        for (i, planned) in self.operations.iter().enumerate() {
            lines.push(format!("  {:>3}. [{}] {}", i + 1, planned.phase, planned.operation));
        }
        lines.join("\n")
    }
}

impl fmt::Display for InstallPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

// ============================================================================
// Planning
// ============================================================================

/// Desktop entry written on Linux
const DESKTOP_ENTRY_TEMPLATE: &str = "[Desktop Entry]\nVersion=1.1\nType=Application\nTerminal=false\nExec=@RunProgram@\nName=@Name@\nIcon=@TargetDir@/main.png\n";

/// Generate the install plan.
///
/// # Errors
///
/// - `UnknownComponent` for a selected id not in the manifest
/// - `UnresolvedPlaceholder` for a template naming an unset variable
/// - `Manifest` for a missing payload directory, a file claimed by two
///   components, or a selection with nothing for this platform
pub fn plan_install(request: &PlanRequest<'_>) -> Result<InstallPlan> {
    let PlanRequest {
        manifest,
        platform,
        target,
        components,
        ..
    } = *request;

    let selected = manifest.select(components, platform)?;
    if selected.is_empty() {
        return Err(InstallError::manifest(format!(
            "none of the selected components apply to {}",
            platform
        )));
    }

    let vars = VariableMap::for_session(manifest, platform, target, request.dirs)?;
    let mut ops: Vec<PlannedOperation> = Vec::new();
    let mut push = |phase, operation| ops.push(PlannedOperation { phase, operation });

    // Directories + payload
    push(
        Phase::Directories,
        Operation::CreateDirectory {
            path: target.to_path_buf(),
        },
    );
    let mut claimed: HashMap<PathBuf, &str> = HashMap::new();
    let mut seen_dirs: BTreeSet<PathBuf> = BTreeSet::new();
    let mut copies = Vec::new();
    for component in &selected {
        let Some(payload) = manifest.payload_dir(component) else {
            continue;
        };
        if !payload.is_dir() {
            return Err(InstallError::manifest(format!(
                "payload of component '{}' not found at {}",
                component.id,
                payload.display()
            )));
        }

        for entry in WalkDir::new(&payload).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                InstallError::manifest(format!("failed to read payload {}: {}", payload.display(), e))
            })?;
            let relative = entry
                .path()
                .strip_prefix(&payload)
                .map_err(|e| InstallError::manifest(e.to_string()))?;
            let destination = target.join(relative);

            if entry.file_type().is_dir() {
                if seen_dirs.insert(destination.clone()) {
                    push(Phase::Directories, Operation::CreateDirectory { path: destination });
                }
                continue;
            }

            if let Some(owner) = claimed.insert(destination.clone(), component.id.as_str()) {
                return Err(InstallError::manifest(format!(
                    "components '{}' and '{}' both install {}",
                    owner,
                    component.id,
                    relative.display()
                )));
            }
            copies.push(Operation::CopyFile {
                source: entry.path().to_path_buf(),
                destination,
            });
        }
    }
    for copy in copies {
        push(Phase::Payload, copy);
    }

    // Prerequisites
    for prerequisite in manifest.required_prerequisites(&selected, platform) {
        if request.probes.is_present(&prerequisite.id) {
            debug!("Prerequisite '{}' present, skipping installer", prerequisite.id);
            continue;
        }
        push(
            Phase::Prerequisites,
            Operation::RunExecutable {
                command: expand_command(&vars, &prerequisite.install)?,
                undo: None,
            },
        );
    }

    // Maintenance tool
    if let Some(source) = request.maintenance_tool_source {
        push(
            Phase::MaintenanceTool,
            Operation::CopyFile {
                source: source.to_path_buf(),
                destination: target.join(platform.executable_name(&manifest.maintenance_tool_name)),
            },
        );
    }

    // Integration
    for operation in launcher_operations(&vars, platform, request)? {
        push(Phase::Integration, operation);
    }

    // Component templates
    for component in &selected {
        for template in component.operations.iter().filter(|t| t.applies_to(platform)) {
            push(Phase::PostInstall, expand_template(&vars, request.dirs, &template.kind)?);
        }
    }

    ops.sort_by_key(|op| op.phase);
    debug!("Planned {} operation(s) for {}", ops.len(), target.display());

    Ok(InstallPlan {
        target: target.to_path_buf(),
        platform,
        components: selected.iter().map(|c| c.id.clone()).collect(),
        operations: ops,
    })
}

/// The platform's launcher strategy, expanded
fn launcher_operations(
    vars: &VariableMap,
    platform: Platform,
    request: &PlanRequest<'_>,
) -> Result<Vec<Operation>> {
    let ops = match platform.launcher_strategy() {
        LauncherStrategy::StartMenuShortcuts => {
            let program = vars.substitute_path("@TargetDir@/@ProductName@.exe")?;
            let working_dir = Some(vars.substitute_path("@TargetDir@")?);

            let mut ops = vec![Operation::CreateShortcut {
                link: vars.substitute_path("@StartMenuDir@/@Name@.lnk")?,
                target: program.clone(),
                working_dir: working_dir.clone(),
            }];

            let maintenance_link = if request.offline {
                "@StartMenuDir@/Uninstall.lnk"
            } else {
                "@StartMenuDir@/@MaintenanceToolName@.lnk"
            };
            ops.push(Operation::CreateShortcut {
                link: vars.substitute_path(maintenance_link)?,
                target: vars.substitute_path("@TargetDir@/@MaintenanceToolName@.exe")?,
                working_dir: working_dir.clone(),
            });

            if request.desktop_shortcut {
                ops.push(Operation::CreateShortcut {
                    link: vars.substitute_path("@DesktopDir@/@Name@.lnk")?,
                    target: program,
                    working_dir,
                });
            }
            ops
        }
        LauncherStrategy::DesktopEntry => vec![Operation::CreateDesktopEntry {
            path: vars.substitute_path("@ApplicationsDir@/@BinaryName@.desktop")?,
            contents: vars.substitute(DESKTOP_ENTRY_TEMPLATE)?,
        }],
        LauncherStrategy::ApplicationLink => vec![Operation::LinkApplication {
            link: vars.substitute_path("@ApplicationsDir@/@Name@.app")?,
            target: vars.substitute_path("@TargetDir@")?,
        }],
    };
    Ok(ops)
}

fn expand_command(vars: &VariableMap, template: &CommandTemplate) -> Result<CommandSpec> {
    Ok(CommandSpec {
        program: vars.substitute(&template.program)?,
        args: vars.substitute_all(&template.args)?,
    })
}

fn expand_template(vars: &VariableMap, dirs: &InstallDirs, kind: &TemplateKind) -> Result<Operation> {
    let op = match kind {
        TemplateKind::CreateShortcut {
            target,
            link,
            working_dir,
        } => Operation::CreateShortcut {
            link: vars.substitute_path(link)?,
            target: vars.substitute_path(target)?,
            working_dir: working_dir
                .as_deref()
                .map(|dir| vars.substitute_path(dir))
                .transpose()?,
        },
        TemplateKind::CreateDesktopEntry { file, contents } => {
            let file = vars.substitute_path(file)?;
            let path = if file.is_absolute() {
                file
            } else {
                dirs.applications_dir.join(file)
            };
            Operation::CreateDesktopEntry {
                path,
                contents: vars.substitute(contents)?,
            }
        }
        TemplateKind::RunExecutable { program, args, undo } => Operation::RunExecutable {
            command: expand_command(
                vars,
                &CommandTemplate {
                    program: program.clone(),
                    args: args.clone(),
                },
            )?,
            undo: undo.as_ref().map(|u| expand_command(vars, u)).transpose()?,
        },
    };
    Ok(op)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"{
        "name": "Pep9Term",
        "maintenance_tool_name": "Pep9-Updater",
        "prerequisites": [{
            "id": "msvc-runtime",
            "display_name": "MSVC runtime",
            "platforms": ["windows"],
            "probe": { "kind": "command", "program": "reg", "args": ["QUERY", "HKLM"] },
            "install": { "program": "@TargetDir@/vc_redist.x64.exe", "args": ["/install", "/quiet"] }
        }],
        "components": [{
            "id": "pep9term",
            "display_name": "Pep/9 Terminal",
            "platforms": ["windows", "macos", "linux"],
            "payload": "payload",
            "requires": ["msvc-runtime"],
            "operations": [
                { "kind": "run_executable", "program": "@TargetDir@/register", "args": ["@Name@"],
                  "undo": { "program": "@TargetDir@/register", "args": ["--remove"] },
                  "platforms": ["linux"] }
            ]
        }]
    }"#;

    struct Fixture {
        _dir: TempDir,
        manifest: Manifest,
        dirs: InstallDirs,
        target: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().expect("tempdir");
        let payload = dir.path().join("repo/payload");
        fs::create_dir_all(payload.join("lib")).expect("payload dirs");
        fs::write(payload.join("Pep9Term"), "bin").expect("binary");
        fs::write(payload.join("lib/a.so"), "a").expect("lib");
        fs::write(payload.join("main.png"), "png").expect("icon");

        let manifest = Manifest::from_json(MANIFEST, dir.path().join("repo")).expect("manifest");
        let home = dir.path().join("home");
        let dirs = InstallDirs {
            start_menu_dir: home.join("menu"),
            desktop_dir: home.join("Desktop"),
            applications_dir: home.join("apps"),
            home_dir: home,
        };
        let target = dir.path().join("opt/pep9");
        Fixture {
            _dir: dir,
            manifest,
            dirs,
            target,
        }
    }

    fn plan(f: &Fixture, platform: Platform, probes: &ProbeReport, offline: bool, desktop: bool) -> Result<InstallPlan> {
        let components = vec!["pep9term".to_string()];
        plan_install(&PlanRequest {
            manifest: &f.manifest,
            platform,
            target: &f.target,
            components: &components,
            offline,
            desktop_shortcut: desktop,
            dirs: &f.dirs,
            maintenance_tool_source: Some(Path::new("/usr/bin/pepinstall")),
            probes,
        })
    }

    #[test]
    fn test_phases_are_ordered() {
        let f = fixture();
        let plan = plan(&f, Platform::Windows, &ProbeReport::new(), false, false).expect("plan");
        let phases: Vec<Phase> = plan.operations.iter().map(|op| op.phase).collect();
        let mut sorted = phases.clone();
        sorted.sort();
        assert_eq!(phases, sorted);
        assert_eq!(plan.operations[0].operation, Operation::CreateDirectory { path: f.target.clone() });
    }

    #[test]
    fn test_payload_walk_is_sorted() {
        let f = fixture();
        let plan = plan(&f, Platform::Linux, &ProbeReport::new(), false, false).expect("plan");
        let copies: Vec<PathBuf> = plan
            .operations
            .iter()
            .filter(|op| op.phase == Phase::Payload)
            .filter_map(|op| op.operation.artifact().map(Path::to_path_buf))
            .collect();
        assert_eq!(
            copies,
            vec![
                f.target.join("Pep9Term"),
                f.target.join("lib/a.so"),
                f.target.join("main.png"),
            ]
        );
        assert_eq!(plan.count(Phase::Directories), 2);
    }

    #[test]
    fn test_missing_prerequisite_installs_before_shortcuts() {
        let f = fixture();
        let plan = plan(&f, Platform::Windows, &ProbeReport::new(), false, false).expect("plan");

        let prereq = plan
            .operations
            .iter()
            .position(|op| op.phase == Phase::Prerequisites)
            .expect("installer planned");
        let shortcut = plan
            .operations
            .iter()
            .position(|op| matches!(op.operation, Operation::CreateShortcut { .. }))
            .expect("shortcut planned");
        assert!(prereq < shortcut);

        let Operation::RunExecutable { command, .. } = &plan.operations[prereq].operation else {
            panic!("prerequisite must be RunExecutable");
        };
        assert_eq!(command.program, format!("{}/vc_redist.x64.exe", f.target.display()));
        assert_eq!(command.args, vec!["/install", "/quiet"]);
    }

    #[test]
    fn test_present_prerequisite_is_omitted() {
        let f = fixture();
        let mut probes = ProbeReport::new();
        probes.record("msvc-runtime", true);
        let plan = plan(&f, Platform::Windows, &probes, false, false).expect("plan");
        assert_eq!(plan.count(Phase::Prerequisites), 0);
    }

    #[test]
    fn test_windows_shortcuts() {
        let f = fixture();
        let online = plan(&f, Platform::Windows, &ProbeReport::new(), false, false).expect("plan");
        let links: Vec<PathBuf> = online
            .operations
            .iter()
            .filter(|op| op.phase == Phase::Integration)
            .filter_map(|op| op.operation.artifact().map(Path::to_path_buf))
            .collect();
        assert_eq!(
            links,
            vec![
                f.dirs.start_menu_dir.join("Pep9Term.lnk"),
                f.dirs.start_menu_dir.join("Pep9-Updater.lnk"),
            ]
        );

        let offline = plan(&f, Platform::Windows, &ProbeReport::new(), true, true).expect("plan");
        let links: Vec<PathBuf> = offline
            .operations
            .iter()
            .filter(|op| op.phase == Phase::Integration)
            .filter_map(|op| op.operation.artifact().map(Path::to_path_buf))
            .collect();
        assert_eq!(
            links,
            vec![
                f.dirs.start_menu_dir.join("Pep9Term.lnk"),
                f.dirs.start_menu_dir.join("Uninstall.lnk"),
                f.dirs.desktop_dir.join("Pep9Term.lnk"),
            ]
        );
    }

    #[test]
    fn test_linux_desktop_entry() {
        let f = fixture();
        let plan = plan(&f, Platform::Linux, &ProbeReport::new(), false, false).expect("plan");
        let entry = plan
            .operations
            .iter()
            .find_map(|op| match &op.operation {
                Operation::CreateDesktopEntry { path, contents } => Some((path, contents)),
                _ => None,
            })
            .expect("desktop entry planned");
        assert_eq!(entry.0, &f.dirs.applications_dir.join("Pep9Term.desktop"));
        assert!(entry.1.contains(&format!("Exec={}/Pep9Term\n", f.target.display())));
        assert!(entry.1.contains("Terminal=false\n"));
        assert!(entry.1.contains(&format!("Icon={}/main.png\n", f.target.display())));

        // Windows-only prerequisite never appears on Linux
        assert_eq!(plan.count(Phase::Prerequisites), 0);
    }

    #[test]
    fn test_macos_application_link() {
        let f = fixture();
        let plan = plan(&f, Platform::MacOs, &ProbeReport::new(), false, false).expect("plan");
        assert!(plan.operations.iter().any(|op| op.operation
            == Operation::LinkApplication {
                link: f.dirs.applications_dir.join("Pep9Term.app"),
                target: f.target.clone(),
            }));
    }

    #[test]
    fn test_templates_are_platform_filtered_and_substituted() {
        let f = fixture();
        let linux = plan(&f, Platform::Linux, &ProbeReport::new(), false, false).expect("plan");
        assert_eq!(linux.count(Phase::PostInstall), 1);
        let Operation::RunExecutable { command, undo } = &linux.operations.last().expect("ops").operation else {
            panic!("template must be RunExecutable");
        };
        assert_eq!(command.args, vec!["Pep9Term"]);
        assert_eq!(undo.as_ref().expect("undo").args, vec!["--remove"]);

        let windows = plan(&f, Platform::Windows, &ProbeReport::new(), false, false).expect("plan");
        assert_eq!(windows.count(Phase::PostInstall), 0);
    }

    #[test]
    fn test_maintenance_tool_gets_exe_suffix_on_windows() {
        let f = fixture();
        let plan = plan(&f, Platform::Windows, &ProbeReport::new(), false, false).expect("plan");
        let tool = plan
            .operations
            .iter()
            .find(|op| op.phase == Phase::MaintenanceTool)
            .expect("tool copy planned");
        assert_eq!(tool.operation.artifact(), Some(f.target.join("Pep9-Updater.exe").as_path()));
    }

    #[test]
    fn test_unknown_component_fails() {
        let f = fixture();
        let components = vec!["nope".to_string()];
        let err = plan_install(&PlanRequest {
            manifest: &f.manifest,
            platform: Platform::Linux,
            target: &f.target,
            components: &components,
            offline: false,
            desktop_shortcut: false,
            dirs: &f.dirs,
            maintenance_tool_source: None,
            probes: &ProbeReport::new(),
        })
        .unwrap_err();
        assert!(matches!(err, InstallError::UnknownComponent(_)));
    }

    #[test]
    fn test_plan_is_deterministic() {
        let f = fixture();
        let a = plan(&f, Platform::Linux, &ProbeReport::new(), false, false).expect("plan");
        let b = plan(&f, Platform::Linux, &ProbeReport::new(), false, false).expect("plan");
        assert_eq!(a, b);
    }

    #[test]
    fn test_plan_summary_not_empty() {
        let f = fixture();
        let plan = plan(&f, Platform::Linux, &ProbeReport::new(), false, false).expect("plan");
        let summary = plan.summary();
        assert!(summary.contains("Components: pep9term"));
        assert!(summary.contains("[payload] CopyFile("));
    }
}
