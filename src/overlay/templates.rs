//! Text templates for the customization overlay.
//!
//! Pure functions of the overlay settings so identical inputs always render
//! identical bytes.

use crate::context::{InitSystem, OverlaySpec, PackageManager};

/// Marker the first-boot script checks before doing anything.
pub const FIRSTBOOT_MARKER: &str = "/var/lib/cyberxp/firstboot.done";
pub const FIRSTBOOT_SCRIPT: &str = "usr/local/sbin/cyberxp-firstboot";
pub const FIRSTBOOT_UNIT: &str = "cyberxp-firstboot.service";
pub const APP_DIR: &str = "opt/cyberxp/dashboard";
pub const DASHBOARD_SERVICE: &str = "cyberxp-dashboard";
pub const DASHBOARD_PORT: u16 = 8080;

pub fn hostname(spec: &OverlaySpec) -> String {
    format!("{}\n", spec.hostname)
}

pub fn hosts(spec: &OverlaySpec) -> String {
    format!(
        "127.0.0.1\tlocalhost\n\
         127.0.1.1\t{host}\n\
         ::1\t\tlocalhost ip6-localhost ip6-loopback\n",
        host = spec.hostname
    )
}

/// Group that grants administrative rights on this distribution family.
pub fn admin_group(manager: PackageManager) -> &'static str {
    match manager {
        PackageManager::Apt => "sudo",
        PackageManager::Apk | PackageManager::Dnf => "wheel",
    }
}

/// Declarative record of the accounts the first-boot script creates.
pub fn accounts(spec: &OverlaySpec, manager: PackageManager) -> String {
    format!(
        "# CyberXP-OS live accounts. Created at first boot.\n\
         # WARNING: both accounts share a placeholder password. Change it.\n\
         # name:role:groups:password-state\n\
         {user}:default::placeholder-insecure\n\
         {admin}:admin:{group}:placeholder-insecure\n",
        user = spec.default_user,
        admin = spec.admin_user,
        group = admin_group(manager),
    )
}

pub fn sudoers(spec: &OverlaySpec) -> String {
    format!(
        "# Managed by cyberxp-builder\n{} ALL=(ALL:ALL) ALL\n",
        spec.admin_user
    )
}

pub fn issue(spec: &OverlaySpec) -> String {
    format!(
        "\nCyberXP-OS Live - \\l\n\n\
         Login as '{}' (admin: '{}').\n\
         The default password is an insecure placeholder. Change it with passwd.\n\n",
        spec.default_user, spec.admin_user
    )
}

/// Idempotent first-boot script: does nothing once the marker exists.
pub fn firstboot_script(spec: &OverlaySpec, manager: PackageManager) -> String {
    let group = admin_group(manager);
    let (add_user, add_admin) = match manager {
        PackageManager::Apk => (
            format!("adduser -D -s /bin/sh {}", spec.default_user),
            format!(
                "adduser -D -s /bin/sh {admin} && addgroup {admin} {group}",
                admin = spec.admin_user,
                group = group
            ),
        ),
        PackageManager::Apt | PackageManager::Dnf => (
            format!("useradd -m -s /bin/bash {}", spec.default_user),
            format!(
                "useradd -m -s /bin/bash -G {} {}",
                group, spec.admin_user
            ),
        ),
    };

    let mut extra = String::new();
    for command in &spec.firstboot_commands {
        extra.push_str(command);
        extra.push('\n');
    }

    format!(
        r#"#!/bin/sh
# CyberXP-OS first boot setup. Safe to run more than once.
set -eu

MARKER={marker}

if [ -e "$MARKER" ]; then
    exit 0
fi

id -u {user} >/dev/null 2>&1 || {add_user}
id -u {admin} >/dev/null 2>&1 || {add_admin}

# Placeholder credential; flagged insecure in the build summary.
printf '%s:%s\n%s:%s\n' {user} '{password}' {admin} '{password}' | chpasswd

if [ -d /{app_dir} ]; then
    chown -R root:root /{app_dir}
fi

{extra}
mkdir -p "$(dirname "$MARKER")"
touch "$MARKER"
"#,
        marker = FIRSTBOOT_MARKER,
        user = spec.default_user,
        admin = spec.admin_user,
        add_user = add_user,
        add_admin = add_admin,
        password = spec.placeholder_password.replace('\'', ""),
        app_dir = APP_DIR,
        extra = extra,
    )
}

pub fn firstboot_unit() -> String {
    format!(
        "[Unit]\n\
         Description=CyberXP-OS first boot setup\n\
         ConditionPathExists=!{marker}\n\
         After=local-fs.target network.target\n\
         \n\
         [Service]\n\
         Type=oneshot\n\
         ExecStart=/{script}\n\
         RemainAfterExit=yes\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        marker = FIRSTBOOT_MARKER,
        script = FIRSTBOOT_SCRIPT,
    )
}

/// OpenRC runs executable `*.start` files from /etc/local.d via the `local` service.
pub fn firstboot_local_d() -> String {
    format!("#!/bin/sh\nexec /{}\n", FIRSTBOOT_SCRIPT)
}

/// systemd-networkd unit for the primary interface.
pub fn networkd_unit(spec: &OverlaySpec) -> String {
    format!(
        "[Match]\nName={}\n\n[Network]\nDHCP=yes\n",
        spec.interface
    )
}

/// ifupdown-style loopback plus DHCP on the primary interface.
pub fn interfaces(spec: &OverlaySpec) -> String {
    format!(
        "auto lo\niface lo inet loopback\n\nauto {iface}\niface {iface} inet dhcp\n",
        iface = spec.interface
    )
}

/// How the bundled dashboard is started, picked from what the app ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DashboardEntry {
    /// `app.py`, run with the system Python.
    Python,
    /// An executable `serve.sh`.
    Script,
    /// Nothing runnable: serve the directory as static files.
    Static,
}

impl DashboardEntry {
    /// Program and arguments, absolute paths inside the image.
    pub fn command(self) -> (String, String) {
        match self {
            DashboardEntry::Python => (
                "/usr/bin/python3".to_string(),
                format!("/{}/app.py", APP_DIR),
            ),
            DashboardEntry::Script => (format!("/{}/serve.sh", APP_DIR), String::new()),
            DashboardEntry::Static => (
                "/usr/bin/python3".to_string(),
                format!(
                    "-m http.server {} --directory /{}",
                    DASHBOARD_PORT, APP_DIR
                ),
            ),
        }
    }
}

pub fn dashboard_unit(entry: DashboardEntry) -> String {
    let (program, args) = entry.command();
    let exec = if args.is_empty() {
        program
    } else {
        format!("{} {}", program, args)
    };
    format!(
        "[Unit]\n\
         Description=CyberXP-OS dashboard (port {port})\n\
         After=network-online.target {firstboot}\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         WorkingDirectory=/{app}\n\
         ExecStart={exec}\n\
         Restart=on-failure\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        port = DASHBOARD_PORT,
        firstboot = FIRSTBOOT_UNIT,
        app = APP_DIR,
        exec = exec,
    )
}

pub fn dashboard_openrc(entry: DashboardEntry) -> String {
    let (program, args) = entry.command();
    format!(
        "#!/sbin/openrc-run\n\
         \n\
         description=\"CyberXP-OS dashboard (port {port})\"\n\
         command=\"{program}\"\n\
         command_args=\"{args}\"\n\
         command_background=true\n\
         directory=\"/{app}\"\n\
         pidfile=\"/run/${{RC_SVCNAME}}.pid\"\n\
         \n\
         depend() {{\n\
         \tneed net\n\
         \tafter local\n\
         }}\n",
        port = DASHBOARD_PORT,
        program = program,
        args = args,
        app = APP_DIR,
    )
}

/// Where the init system looks for an enabled service and what it points to.
pub fn service_link(init: InitSystem, service: &str) -> (String, String) {
    match init {
        InitSystem::Systemd => {
            let unit = if service.contains('.') {
                service.to_string()
            } else {
                format!("{}.service", service)
            };
            (
                format!("etc/systemd/system/multi-user.target.wants/{}", unit),
                format!("/lib/systemd/system/{}", unit),
            )
        }
        InitSystem::OpenRc => (
            format!("etc/runlevels/default/{}", service),
            format!("/etc/init.d/{}", service),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> OverlaySpec {
        OverlaySpec {
            hostname: "cyberxp".into(),
            init: InitSystem::Systemd,
            interface: "eth0".into(),
            default_user: "analyst".into(),
            admin_user: "admin".into(),
            placeholder_password: "changeme".into(),
            services: vec![],
            app_dir: None,
            firstboot_commands: vec!["systemctl enable --now clamav-freshclam".into()],
            ship_in_image: true,
            merge_into_rootfs: true,
        }
    }

    #[test]
    fn firstboot_is_guarded_by_marker() {
        let script = firstboot_script(&spec(), PackageManager::Apt);
        let guard = script.find("if [ -e \"$MARKER\" ]").unwrap();
        let work = script.find("useradd").unwrap();
        assert!(guard < work);
        assert!(script.contains("useradd -m -s /bin/bash -G sudo admin"));
        assert!(script.contains("systemctl enable --now clamav-freshclam"));
        assert!(script.trim_end().ends_with("touch \"$MARKER\""));
    }

    #[test]
    fn alpine_accounts_use_busybox_tools() {
        let script = firstboot_script(&spec(), PackageManager::Apk);
        assert!(script.contains("adduser -D -s /bin/sh analyst"));
        assert!(script.contains("addgroup admin wheel"));
    }

    #[test]
    fn dashboard_units_start_the_entrypoint() {
        let unit = dashboard_unit(DashboardEntry::Python);
        assert!(unit.contains("ExecStart=/usr/bin/python3 /opt/cyberxp/dashboard/app.py\n"));
        assert!(unit.contains("WantedBy=multi-user.target"));

        let unit = dashboard_unit(DashboardEntry::Script);
        assert!(unit.contains("ExecStart=/opt/cyberxp/dashboard/serve.sh\n"));

        let script = dashboard_openrc(DashboardEntry::Static);
        assert!(script.starts_with("#!/sbin/openrc-run\n"));
        assert!(script.contains(
            "command_args=\"-m http.server 8080 --directory /opt/cyberxp/dashboard\""
        ));
        assert!(script.contains("pidfile=\"/run/${RC_SVCNAME}.pid\""));
    }

    #[test]
    fn service_links_per_init() {
        assert_eq!(
            service_link(InitSystem::Systemd, "ssh"),
            (
                "etc/systemd/system/multi-user.target.wants/ssh.service".to_string(),
                "/lib/systemd/system/ssh.service".to_string()
            )
        );
        assert_eq!(
            service_link(InitSystem::OpenRc, "sshd").0,
            "etc/runlevels/default/sshd"
        );
    }
}
