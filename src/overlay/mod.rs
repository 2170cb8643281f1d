//! Customization overlay.
//!
//! [`OverlayBundle::compose`] renders hostname, accounts, network defaults,
//! service-enable links, the first-boot script and the bundled dashboard into
//! an in-memory, path-sorted entry map. The same bundle can be written as a
//! deterministic `overlay.tar.zst` and applied onto a rootfs any number of
//! times with the same result.

pub mod archive;
pub mod templates;

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use self::templates::DashboardEntry;
use crate::context::{BuildContext, InitSystem, OverlaySpec};
use crate::error::{BuildError, Result};

pub const ARCHIVE_NAME: &str = "overlay.tar.zst";
pub const MANIFEST_PATH: &str = "etc/cyberxp/overlay.manifest";

/// One node of the overlay tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Dir { mode: u32 },
    File { content: Vec<u8>, mode: u32 },
    Symlink { target: PathBuf },
}

/// Composed overlay, keyed by path relative to `/`.
#[derive(Debug, Clone, Default)]
pub struct OverlayBundle {
    entries: BTreeMap<PathBuf, Entry>,
    placeholder_user: Vec<String>,
}

impl OverlayBundle {
    /// Render the overlay for `ctx`. Reads only the local app directory.
    pub fn compose(ctx: &BuildContext) -> Result<Self> {
        let spec = &ctx.overlay;
        let manager = ctx.packages.manager;
        validate(spec)?;

        let mut bundle = OverlayBundle::default();
        bundle.file("etc/hostname", templates::hostname(spec), 0o644);
        bundle.file("etc/hosts", templates::hosts(spec), 0o644);
        bundle.file("etc/issue", templates::issue(spec), 0o644);
        bundle.file("etc/cyberxp/accounts", templates::accounts(spec, manager), 0o600);
        bundle.file(
            &format!("etc/sudoers.d/cyberxp-{}", spec.admin_user),
            templates::sudoers(spec),
            0o440,
        );
        bundle.file(
            templates::FIRSTBOOT_SCRIPT,
            templates::firstboot_script(spec, manager),
            0o755,
        );

        match spec.init {
            InitSystem::Systemd => {
                let unit_path = format!("etc/systemd/system/{}", templates::FIRSTBOOT_UNIT);
                bundle.file(&unit_path, templates::firstboot_unit(), 0o644);
                bundle.symlink(
                    &format!(
                        "etc/systemd/system/multi-user.target.wants/{}",
                        templates::FIRSTBOOT_UNIT
                    ),
                    &format!("/{}", unit_path),
                );
                bundle.file(
                    &format!("etc/systemd/network/20-{}.network", spec.interface),
                    templates::networkd_unit(spec),
                    0o644,
                );
                bundle.enable_service(InitSystem::Systemd, "systemd-networkd");
            }
            InitSystem::OpenRc => {
                bundle.file(
                    "etc/local.d/50-cyberxp-firstboot.start",
                    templates::firstboot_local_d(),
                    0o755,
                );
                bundle.file("etc/network/interfaces", templates::interfaces(spec), 0o644);
                bundle.enable_service(InitSystem::OpenRc, "local");
                bundle.enable_service(InitSystem::OpenRc, "networking");
            }
        }

        for service in &spec.services {
            bundle.enable_service(spec.init, service);
        }

        if let Some(app_dir) = &spec.app_dir {
            bundle.add_tree(app_dir, templates::APP_DIR)?;
            bundle.add_dashboard_service(spec.init);
        }

        bundle.placeholder_user = vec![spec.default_user.clone(), spec.admin_user.clone()];

        let manifest = bundle.render_manifest();
        bundle.file(MANIFEST_PATH, manifest, 0o644);

        info!(
            entries = bundle.entries.len(),
            init = ?spec.init,
            manager = %manager,
            "overlay composed"
        );
        Ok(bundle)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&PathBuf, &Entry)> {
        self.entries.iter()
    }

    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.entries.get(Path::new(path))
    }

    /// Target paths of files and links (directories are implied).
    pub fn manifest(&self) -> Vec<&Path> {
        self.entries
            .iter()
            .filter(|(_, e)| !matches!(e, Entry::Dir { .. }))
            .map(|(p, _)| p.as_path())
            .collect()
    }

    /// Summary line flagging the shipped placeholder credential.
    pub fn placeholder_warning(&self) -> String {
        format!(
            "INSECURE DEFAULT: accounts {} share a placeholder password; change it before any non-lab use",
            self.placeholder_user.join(", ")
        )
    }

    /// Serialize to a deterministic tar.zst at `out`.
    pub fn write_archive(&self, out: &Path) -> Result<()> {
        archive::write(self.entries.iter(), out)?;
        info!(path = %out.display(), "overlay archive written");
        Ok(())
    }

    /// Apply onto `root`. Existing files and links at overlay paths are replaced.
    pub fn apply_to(&self, root: &Path) -> Result<()> {
        for (rel, entry) in &self.entries {
            let dest = root.join(rel);
            match entry {
                Entry::Dir { mode } => {
                    if fs::symlink_metadata(&dest).is_err() {
                        fs::create_dir_all(&dest)
                            .map_err(|e| BuildError::io("creating directory", &dest, e))?;
                        fs::set_permissions(&dest, fs::Permissions::from_mode(*mode))
                            .map_err(|e| BuildError::io("chmod", &dest, e))?;
                    }
                }
                Entry::File { content, mode } => {
                    remove_non_dir(&dest)?;
                    fs::write(&dest, content).map_err(|e| BuildError::io("writing", &dest, e))?;
                    fs::set_permissions(&dest, fs::Permissions::from_mode(*mode))
                        .map_err(|e| BuildError::io("chmod", &dest, e))?;
                }
                Entry::Symlink { target } => {
                    remove_non_dir(&dest)?;
                    symlink(target, &dest)
                        .map_err(|e| BuildError::io("creating symlink", &dest, e))?;
                }
            }
        }
        debug!(root = %root.display(), entries = self.entries.len(), "overlay applied");
        Ok(())
    }

    fn file(&mut self, rel: &str, content: impl Into<Vec<u8>>, mode: u32) {
        let path = PathBuf::from(rel);
        self.add_parents(&path);
        self.entries.insert(
            path,
            Entry::File {
                content: content.into(),
                mode,
            },
        );
    }

    fn symlink(&mut self, rel: &str, target: &str) {
        let path = PathBuf::from(rel);
        self.add_parents(&path);
        self.entries.insert(
            path,
            Entry::Symlink {
                target: PathBuf::from(target),
            },
        );
    }

    fn enable_service(&mut self, init: InitSystem, service: &str) {
        let (link, target) = templates::service_link(init, service);
        self.symlink(&link, &target);
    }

    /// Service for the bundled app, enabled at boot. Runs after the app tree is added.
    fn add_dashboard_service(&mut self, init: InitSystem) {
        let app = Path::new(templates::APP_DIR);
        let entry = match (
            self.entries.get(&app.join("app.py")),
            self.entries.get(&app.join("serve.sh")),
        ) {
            (Some(Entry::File { .. }), _) => DashboardEntry::Python,
            (_, Some(Entry::File { mode, .. })) if mode & 0o111 != 0 => DashboardEntry::Script,
            _ => DashboardEntry::Static,
        };
        let name = templates::DASHBOARD_SERVICE;
        match init {
            InitSystem::Systemd => {
                let unit_path = format!("etc/systemd/system/{}.service", name);
                self.file(&unit_path, templates::dashboard_unit(entry), 0o644);
                self.symlink(
                    &format!("etc/systemd/system/multi-user.target.wants/{}.service", name),
                    &format!("/{}", unit_path),
                );
            }
            InitSystem::OpenRc => {
                self.file(
                    &format!("etc/init.d/{}", name),
                    templates::dashboard_openrc(entry),
                    0o755,
                );
                self.enable_service(InitSystem::OpenRc, name);
            }
        }
        debug!(?entry, "dashboard service added");
    }

    fn add_parents(&mut self, path: &Path) {
        for ancestor in path.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            self.entries
                .entry(ancestor.to_path_buf())
                .or_insert(Entry::Dir { mode: 0o755 });
        }
    }

    /// Copy a host directory verbatim under `prefix`, in sorted order.
    fn add_tree(&mut self, src: &Path, prefix: &str) -> Result<()> {
        if !src.is_dir() {
            return Err(BuildError::Config(format!(
                "overlay app_dir {} is not a directory",
                src.display()
            )));
        }
        let prefix = PathBuf::from(prefix);
        self.add_parents(&prefix.join("x"));

        for entry in WalkDir::new(src)
            .follow_links(false)
            .sort_by_file_name()
            .min_depth(1)
        {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(src).to_path_buf();
                BuildError::io("walking app dir", path, e.into())
            })?;
            let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
            let dest = prefix.join(rel);
            let meta = entry
                .path()
                .symlink_metadata()
                .map_err(|e| BuildError::io("stat", entry.path(), e))?;

            let node = if meta.file_type().is_symlink() {
                let target = fs::read_link(entry.path())
                    .map_err(|e| BuildError::io("reading symlink", entry.path(), e))?;
                Entry::Symlink { target }
            } else if meta.is_dir() {
                Entry::Dir { mode: 0o755 }
            } else if meta.is_file() {
                let content =
                    fs::read(entry.path()).map_err(|e| BuildError::io("reading", entry.path(), e))?;
                let mode = if meta.permissions().mode() & 0o111 != 0 {
                    0o755
                } else {
                    0o644
                };
                Entry::File { content, mode }
            } else {
                continue;
            };
            self.entries.insert(dest, node);
        }
        Ok(())
    }

    fn render_manifest(&self) -> String {
        let mut out = String::from("# paths installed by the CyberXP-OS overlay\n");
        for path in self.manifest() {
            out.push('/');
            out.push_str(&path.to_string_lossy());
            out.push('\n');
        }
        out.push('/');
        out.push_str(MANIFEST_PATH);
        out.push('\n');
        out
    }
}

/// Compose the overlay for `ctx` and write it to the build's overlay dir.
pub fn compose_to_build_dir(ctx: &BuildContext) -> Result<(OverlayBundle, PathBuf)> {
    let bundle = OverlayBundle::compose(ctx)?;
    let path = ctx.layout().overlay.join(ARCHIVE_NAME);
    bundle.write_archive(&path)?;
    Ok((bundle, path))
}

fn remove_non_dir(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Err(BuildError::Postcondition(format!(
            "overlay path {} is a directory in the target root",
            path.display()
        ))),
        Ok(_) => fs::remove_file(path).map_err(|e| BuildError::io("removing", path, e)),
        Err(_) => Ok(()),
    }
}

fn validate(spec: &OverlaySpec) -> Result<()> {
    let host_ok = !spec.hostname.is_empty()
        && spec.hostname.len() <= 63
        && spec
            .hostname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        && !spec.hostname.starts_with('-')
        && !spec.hostname.ends_with('-');
    if !host_ok {
        return Err(BuildError::Config(format!(
            "invalid hostname '{}'",
            spec.hostname
        )));
    }

    for user in [&spec.default_user, &spec.admin_user] {
        let valid = !user.is_empty()
            && user.len() <= 32
            && user
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
            && user
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
        if !valid {
            return Err(BuildError::Config(format!("invalid account name '{}'", user)));
        }
    }
    if spec.default_user == spec.admin_user {
        return Err(BuildError::Config(
            "default and admin accounts must differ".to_string(),
        ));
    }

    let bad_name = |s: &str| s.is_empty() || s.contains('/') || s.contains("..");
    if bad_name(&spec.interface) {
        return Err(BuildError::Config(format!(
            "invalid interface name '{}'",
            spec.interface
        )));
    }
    if let Some(service) = spec.services.iter().find(|s| bad_name(s)) {
        return Err(BuildError::Config(format!("invalid service name '{}'", service)));
    }
    if spec.app_dir.is_none() && spec.services.iter().any(|s| s == templates::DASHBOARD_SERVICE) {
        return Err(BuildError::Config(format!(
            "service '{}' is enabled but overlay.app_dir is not set",
            templates::DASHBOARD_SERVICE
        )));
    }
    if spec.placeholder_password.is_empty() || spec.placeholder_password.contains(['\n', ':']) {
        return Err(BuildError::Config(
            "placeholder_password must be non-empty and contain no ':' or newline".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use tempfile::TempDir;

    fn ctx_with_app(app: &Path, init: &str) -> BuildContext {
        let text = format!(
            r#"
[image]
name = "cyberxp-os"
version = "1.0"

[base]
distro = "debian"
release = "bookworm"
mirrors = ["http://mirror.example/base.tar.gz"]

[packages]
essential = ["linux-image-amd64"]

[overlay]
hostname = "cyberxp"
init = "{init}"
services = ["ssh", "cyberxp-dashboard"]
app_dir = "{app}"
"#,
            init = init,
            app = app.display()
        );
        config::parse(&text, Path::new("/")).unwrap()
    }

    fn app_dir(tmp: &TempDir) -> PathBuf {
        let app = tmp.path().join("dashboard");
        fs::create_dir_all(app.join("static")).unwrap();
        fs::write(app.join("index.html"), "<h1>CyberXP</h1>").unwrap();
        fs::write(app.join("static/app.js"), "render()").unwrap();
        fs::write(app.join("serve.sh"), "#!/bin/sh\n").unwrap();
        fs::set_permissions(app.join("serve.sh"), fs::Permissions::from_mode(0o755)).unwrap();
        app
    }

    #[test]
    fn composes_expected_systemd_entries() {
        let tmp = TempDir::new().unwrap();
        let ctx = ctx_with_app(&app_dir(&tmp), "systemd");
        let bundle = OverlayBundle::compose(&ctx).unwrap();

        assert_eq!(
            bundle.get("etc/hostname"),
            Some(&Entry::File {
                content: b"cyberxp\n".to_vec(),
                mode: 0o644
            })
        );
        assert!(matches!(
            bundle.get("etc/systemd/system/multi-user.target.wants/ssh.service"),
            Some(Entry::Symlink { .. })
        ));
        assert!(bundle.get("etc/systemd/network/20-eth0.network").is_some());
        assert!(matches!(
            bundle.get("opt/cyberxp/dashboard/serve.sh"),
            Some(Entry::File { mode: 0o755, .. })
        ));
        assert!(matches!(bundle.get("opt/cyberxp"), Some(Entry::Dir { .. })));
        assert!(bundle.placeholder_warning().contains("INSECURE"));

        // The enable link points at a unit the bundle actually ships.
        assert_eq!(
            bundle.get("etc/systemd/system/multi-user.target.wants/cyberxp-dashboard.service"),
            Some(&Entry::Symlink {
                target: PathBuf::from("/etc/systemd/system/cyberxp-dashboard.service")
            })
        );
        match bundle.get("etc/systemd/system/cyberxp-dashboard.service") {
            Some(Entry::File { content, .. }) => {
                let unit = String::from_utf8_lossy(content);
                assert!(unit.contains("ExecStart=/opt/cyberxp/dashboard/serve.sh\n"));
            }
            other => panic!("missing dashboard unit: {other:?}"),
        }
    }

    #[test]
    fn static_app_is_served_and_python_app_is_run() {
        let tmp = TempDir::new().unwrap();
        let app = tmp.path().join("static-only");
        fs::create_dir_all(&app).unwrap();
        fs::write(app.join("index.html"), "<h1>CyberXP</h1>").unwrap();
        let bundle = OverlayBundle::compose(&ctx_with_app(&app, "systemd")).unwrap();
        match bundle.get("etc/systemd/system/cyberxp-dashboard.service") {
            Some(Entry::File { content, .. }) => {
                assert!(String::from_utf8_lossy(content).contains("-m http.server 8080"));
            }
            other => panic!("missing dashboard unit: {other:?}"),
        }

        fs::write(app.join("app.py"), "app.run(port=8080)").unwrap();
        let bundle = OverlayBundle::compose(&ctx_with_app(&app, "openrc")).unwrap();
        match bundle.get("etc/init.d/cyberxp-dashboard") {
            Some(Entry::File { content, mode }) => {
                assert_eq!(*mode, 0o755);
                assert!(String::from_utf8_lossy(content)
                    .contains("command_args=\"/opt/cyberxp/dashboard/app.py\""));
            }
            other => panic!("missing dashboard init script: {other:?}"),
        }
        assert_eq!(
            bundle.get("etc/runlevels/default/cyberxp-dashboard"),
            Some(&Entry::Symlink {
                target: PathBuf::from("/etc/init.d/cyberxp-dashboard")
            })
        );
    }

    #[test]
    fn dashboard_service_needs_an_app() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = ctx_with_app(&app_dir(&tmp), "systemd");
        ctx.overlay.app_dir = None;
        assert!(matches!(
            OverlayBundle::compose(&ctx).unwrap_err(),
            BuildError::Config(_)
        ));
    }

    #[test]
    fn openrc_uses_runlevels_and_local_d() {
        let tmp = TempDir::new().unwrap();
        let ctx = ctx_with_app(&app_dir(&tmp), "openrc");
        let bundle = OverlayBundle::compose(&ctx).unwrap();
        assert!(bundle.get("etc/runlevels/default/local").is_some());
        assert!(bundle.get("etc/runlevels/default/ssh").is_some());
        assert!(bundle.get("etc/network/interfaces").is_some());
        assert!(bundle.get("etc/local.d/50-cyberxp-firstboot.start").is_some());
    }

    #[test]
    fn archive_is_byte_identical_across_runs() {
        let tmp = TempDir::new().unwrap();
        let ctx = ctx_with_app(&app_dir(&tmp), "systemd");

        let first = tmp.path().join("a.tar.zst");
        let second = tmp.path().join("b.tar.zst");
        OverlayBundle::compose(&ctx).unwrap().write_archive(&first).unwrap();
        OverlayBundle::compose(&ctx).unwrap().write_archive(&second).unwrap();

        assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());

        let names = archive::list(&first).unwrap();
        assert_eq!(names[0].trim_end_matches('/'), "etc");
        assert!(names.iter().any(|n| n == MANIFEST_PATH));
        let hostname = archive::read_file(&first, "etc/hostname").unwrap().unwrap();
        assert_eq!(hostname, b"cyberxp\n");
    }

    #[test]
    fn apply_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let ctx = ctx_with_app(&app_dir(&tmp), "systemd");
        let bundle = OverlayBundle::compose(&ctx).unwrap();
        let root = tmp.path().join("rootfs");
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("etc/hostname"), "debian\n").unwrap();

        bundle.apply_to(&root).unwrap();
        bundle.apply_to(&root).unwrap();

        assert_eq!(fs::read_to_string(root.join("etc/hostname")).unwrap(), "cyberxp\n");
        assert_eq!(
            fs::read_link(root.join("etc/systemd/system/multi-user.target.wants/ssh.service"))
                .unwrap(),
            PathBuf::from("/lib/systemd/system/ssh.service")
        );
        let manifest = fs::read_to_string(root.join(MANIFEST_PATH)).unwrap();
        assert!(manifest.contains("/opt/cyberxp/dashboard/index.html"));
    }

    #[test]
    fn rejects_bad_names() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = ctx_with_app(&app_dir(&tmp), "systemd");
        ctx.overlay.hostname = "bad_host!".into();
        assert!(matches!(
            OverlayBundle::compose(&ctx).unwrap_err(),
            BuildError::Config(_)
        ));

        let mut ctx = ctx_with_app(&app_dir(&tmp), "systemd");
        ctx.overlay.admin_user = ctx.overlay.default_user.clone();
        assert!(OverlayBundle::compose(&ctx).is_err());
    }
}
