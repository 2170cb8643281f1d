mod common;

use std::fs;

use tempfile::TempDir;

use common::{base_archive, context, iso_members, FakeExecutor, FakeFetcher, FakeProbe, RecordingMounter, KERNEL};
use cyberxp_builder::artifact::bootloader::parse_menu_labels;
use cyberxp_builder::lock::BuildLock;
use cyberxp_builder::overlay::{self, OverlayBundle};
use cyberxp_builder::pipeline::RunStatus;
use cyberxp_builder::{BuildContext, BuildError, CancelToken, Host, Pipeline, PipelineFailure, RunSummary, State};

const MIRROR: &str = "http://mirror-a.example/debian-bookworm-rootfs.tar.gz";

struct Harness {
    _tmp: TempDir,
    ctx: BuildContext,
    cancel: CancelToken,
    exec: FakeExecutor,
    mounter: RecordingMounter,
    fetcher: FakeFetcher,
    probe: FakeProbe,
}

impl Harness {
    fn new() -> Self {
        Self::with_mirrors(&[MIRROR])
    }

    fn with_mirrors(mirrors: &[&str]) -> Self {
        let tmp = TempDir::new().unwrap();
        let ctx = context(tmp.path(), mirrors);
        let cancel = CancelToken::new();
        Self {
            exec: FakeExecutor::new(cancel.clone()),
            mounter: RecordingMounter::default(),
            fetcher: FakeFetcher::serving(base_archive()),
            probe: FakeProbe::default(),
            ctx,
            cancel,
            _tmp: tmp,
        }
    }

    fn run(&self) -> Result<RunSummary, PipelineFailure> {
        let host = Host {
            exec: &self.exec,
            mounter: &self.mounter,
            fetcher: &self.fetcher,
            probe: &self.probe,
        };
        Pipeline::new(&self.ctx, host, self.cancel.clone()).run()
    }
}

fn assert_failed_cleanly(h: &Harness, failure: &PipelineFailure, stage: State) {
    assert_eq!(failure.stage, stage, "unexpected stage: {}", failure);
    assert!(
        h.mounter.active().is_empty(),
        "mounts left after failure in {}: {:?}",
        stage,
        h.mounter.active()
    );
    let states = &failure.summary.states;
    assert_eq!(&states[states.len() - 2..], &[State::TearingDown, State::Failed]);
    assert_eq!(failure.summary.status, RunStatus::Failed);
    assert!(!h.ctx.artifact_path().exists());

    let json: serde_json::Value =
        serde_json::from_slice(&fs::read(h.ctx.summary_path()).unwrap()).unwrap();
    assert_eq!(json["status"], "failed");
    assert_eq!(json["failed_stage"], stage.as_str());
}

#[test]
fn end_to_end_builds_hybrid_image() {
    let h = Harness::new();
    let summary = h.run().unwrap();

    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(
        &summary.states[summary.states.len() - 3..],
        &[State::Assembling, State::TearingDown, State::Done]
    );
    assert!(summary.states.contains(&State::CompressingConfiguring));
    assert_eq!(summary.kernel_version.as_deref(), Some(KERNEL));
    assert_eq!(summary.mirror.as_deref(), Some(MIRROR));

    let artifact = summary.artifact.as_ref().unwrap();
    assert_eq!(artifact.path, h.ctx.artifact_path());
    assert!(artifact.path.ends_with("out/cyberxp-os-1.0.0.iso"));
    assert!(artifact.size > 0);
    assert_eq!(artifact.boot_modes, vec!["bios", "uefi"]);
    let sidecar = fs::read_to_string(h.ctx.output_dir.join("cyberxp-os-1.0.0.iso.sha256")).unwrap();
    assert_eq!(sidecar, format!("{}  cyberxp-os-1.0.0.iso\n", artifact.sha256));

    let members = iso_members(&artifact.path);
    assert_eq!(members["live/vmlinuz"], format!("kernel {}", KERNEL).into_bytes());
    assert_eq!(members["live/initrd.img"], format!("initrd {}", KERNEL).into_bytes());
    assert!(members.contains_key("live/filesystem.squashfs"));
    assert!(members.contains_key("isolinux/isolinux.bin"));
    assert!(members.contains_key("EFI/BOOT/BOOTX64.EFI"));
    assert!(members.contains_key("boot/grub/efiboot.img"));
    assert!(members.contains_key(overlay::ARCHIVE_NAME));

    let isolinux = String::from_utf8(members["isolinux/isolinux.cfg"].clone()).unwrap();
    let grub = String::from_utf8(members["boot/grub/grub.cfg"].clone()).unwrap();
    assert_eq!(parse_menu_labels(&isolinux), vec!["live", "verbose", "recovery"]);
    assert_eq!(parse_menu_labels(&grub).len(), 3);
    assert!(isolinux.starts_with("UI menu.c32"));
    assert!(grub.contains("--label CYBERXP_OS"));

    assert!(h.mounter.active().is_empty());
    let log = h.mounter.log();
    assert_eq!(log.iter().filter(|l| l.starts_with("mount ")).count(), 4);
    assert_eq!(log.iter().filter(|l| l.starts_with("umount ")).count(), 4);

    assert!(summary.warnings.iter().any(|w| w.starts_with("INSECURE DEFAULT")));
    assert!(h.exec.ran(&format!("depmod -a {}", KERNEL)));
    assert!(h.exec.ran(&format!("update-initramfs -c -k {}", KERNEL)));
    assert!(h.ctx.summary_path().exists());
    assert!(!h.ctx.layout().rootfs.exists(), "work tree should be removed");
}

#[test]
fn keep_build_dir_retains_merged_rootfs() {
    let mut h = Harness::new();
    h.ctx.keep_build_dir = true;
    h.run().unwrap();

    let rootfs = h.ctx.layout().rootfs;
    assert!(rootfs.join("etc/hostname").exists());
    assert!(rootfs.join("usr/local/sbin/cyberxp-firstboot").exists());
    assert!(rootfs.join("opt/cyberxp/dashboard/index.html").exists());
    assert!(!rootfs.join("usr/sbin/policy-rc.d").exists());
    assert!(h.ctx.build_dir.join(cyberxp_builder::rootfs::ACQUISITION_MARKER).exists());
}

#[test]
fn failed_run_does_not_leave_a_reusable_rootfs() {
    let mut h = Harness::new();
    h.ctx.keep_build_dir = true;
    h.exec.broken.insert("live-boot".to_string());
    let failure = h.run().unwrap_err();
    assert_failed_cleanly(&h, &failure, State::Installing);
    assert!(h.ctx.layout().rootfs.exists());
    assert!(!h.ctx.build_dir.join(cyberxp_builder::rootfs::ACQUISITION_MARKER).exists());

    h.exec.broken.clear();
    let summary = h.run().unwrap();
    assert!(!summary.rootfs_from_cache);
    assert_eq!(summary.mirror.as_deref(), Some(MIRROR));
    assert_eq!(h.fetcher.calls().len(), 2);

    // A successful kept run is reused by the next one.
    let summary = h.run().unwrap();
    assert!(summary.rootfs_from_cache);
    assert_eq!(h.fetcher.calls().len(), 2);
}

#[test]
fn third_mirror_serves_after_two_failures() {
    let urls = [
        "http://a.example/rootfs.tar.gz",
        "http://b.example/rootfs.tar.gz",
        "http://c.example/rootfs.tar.gz",
    ];
    let mut h = Harness::with_mirrors(&urls);
    h.fetcher = FakeFetcher::serving(base_archive())
        .failing(urls[0])
        .failing(urls[1]);

    let summary = h.run().unwrap();
    assert_eq!(summary.mirror.as_deref(), Some(urls[2]));
    assert_eq!(summary.failed_fetch_attempts.len(), 2);
    assert_eq!(summary.failed_fetch_attempts[0].endpoint, urls[0]);
    assert_eq!(h.fetcher.calls(), urls.to_vec());
}

#[test]
fn every_mirror_failing_ends_in_acquiring() {
    let urls = ["http://a.example/r.tar.gz", "http://b.example/r.tar.gz"];
    let mut h = Harness::with_mirrors(&urls);
    h.fetcher = FakeFetcher::serving(base_archive())
        .failing(urls[0])
        .failing(urls[1]);

    let failure = h.run().unwrap_err();
    assert_failed_cleanly(&h, &failure, State::Acquiring);
    match &failure.error {
        BuildError::RetryableFetch { attempts } => assert_eq!(attempts.len(), 2),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn optional_failure_degrades_to_bios_only() {
    let mut h = Harness::new();
    h.exec.broken.insert("grub-efi-amd64-bin".to_string());

    let summary = h.run().unwrap();
    assert_eq!(summary.skipped_packages, vec!["grub-efi-amd64-bin"]);
    assert!(summary
        .warnings
        .iter()
        .any(|w| w.contains("grub-efi-amd64-bin")));
    assert!(summary.warnings.iter().any(|w| w.contains("UEFI loader not found")));

    let artifact = summary.artifact.unwrap();
    assert!(artifact.size > 0);
    assert_eq!(artifact.boot_modes, vec!["bios"]);
    let members = iso_members(&artifact.path);
    assert!(members.contains_key("isolinux/isolinux.cfg"));
    assert!(!members.contains_key("boot/grub/efiboot.img"));
    assert!(!h.exec.ran("mkfs.fat"));
}

#[test]
fn essential_failure_is_fatal() {
    let mut h = Harness::new();
    h.exec.broken.insert("live-boot".to_string());

    let failure = h.run().unwrap_err();
    assert_failed_cleanly(&h, &failure, State::Installing);
    match &failure.error {
        BuildError::EssentialInstall { packages, detail } => {
            assert!(packages.contains(&"live-boot".to_string()));
            assert!(detail.contains("Unable to locate package live-boot"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(failure.to_string().starts_with("stage Installing failed:"));
}

#[test]
fn failure_in_every_state_leaves_no_mounts() {
    type Inject = fn(&mut Harness);
    let cases: Vec<(State, Inject)> = vec![
        (State::Preflight, (|h: &mut Harness| {
            h.probe.missing_tools = vec!["xorriso".into()]
        }) as Inject),
        (State::Acquiring, |h: &mut Harness| {
            h.fetcher = FakeFetcher::serving(base_archive()).failing(MIRROR)
        }),
        (State::BuildRootActive, |h: &mut Harness| {
            h.mounter.fail_mount_at = Some(2)
        }),
        (State::Installing, |h: &mut Harness| {
            h.exec.fail_on = Some("apt-get -o Acquire::Retries=3 update".into())
        }),
        (State::Composing, |h: &mut Harness| {
            h.ctx.overlay.hostname = "not a hostname".into()
        }),
        (State::GeneratingBoot, |h: &mut Harness| {
            h.exec.fail_on = Some("depmod".into())
        }),
        (State::CompressingConfiguring, |h: &mut Harness| {
            h.exec.fail_on = Some("mksquashfs".into())
        }),
        (State::Assembling, |h: &mut Harness| {
            h.exec.fail_on = Some("xorriso".into())
        }),
    ]
    .into_iter()
    .map(|(stage, inject)| (stage, inject as Inject))
    .collect();

    for (stage, inject) in cases {
        let mut h = Harness::new();
        inject(&mut h);
        let failure = h.run().unwrap_err();
        assert_failed_cleanly(&h, &failure, stage);
    }
}

#[test]
fn interrupt_mid_install_tears_down() {
    let mut h = Harness::new();
    h.exec.cancel_on = Some("install -y".into());

    let failure = h.run().unwrap_err();
    assert!(matches!(failure.error, BuildError::Interrupted));
    assert_failed_cleanly(&h, &failure, State::Installing);
    assert_eq!(failure.summary.error_kind, Some("interrupted"));
}

#[test]
fn busy_mount_is_retried_during_final_teardown() {
    let h = Harness::new();
    *h.mounter.fail_unmount_once.lock().unwrap() = Some("dev/pts".to_string());

    let failure = h.run().unwrap_err();
    assert!(matches!(failure.error, BuildError::Postcondition(_)));
    assert_failed_cleanly(&h, &failure, State::GeneratingBoot);
}

#[test]
fn newest_kernel_by_install_time() {
    let mut h = Harness::new();
    h.exec.kernels = vec![
        ("6.9.0-1-amd64".to_string(), 1_000),
        ("6.10.0-2-amd64".to_string(), 2_000),
    ];

    let summary = h.run().unwrap();
    assert_eq!(summary.kernel_version.as_deref(), Some("6.10.0-2-amd64"));
    assert_eq!(summary.kernel_candidates, vec!["6.10.0-2-amd64", "6.9.0-1-amd64"]);
    assert!(summary.render().contains("newest of 6.10.0-2-amd64, 6.9.0-1-amd64"));
    let members = iso_members(&summary.artifact.unwrap().path);
    assert_eq!(members["live/vmlinuz"], b"kernel 6.10.0-2-amd64".to_vec());
    assert!(h.exec.ran("update-initramfs -c -k 6.9.0-1-amd64"));
}

#[test]
fn overlay_is_byte_identical_across_builds() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path(), &[MIRROR]);
    let first = tmp.path().join("a").join(overlay::ARCHIVE_NAME);
    let second = tmp.path().join("b").join(overlay::ARCHIVE_NAME);
    OverlayBundle::compose(&ctx).unwrap().write_archive(&first).unwrap();
    OverlayBundle::compose(&ctx).unwrap().write_archive(&second).unwrap();
    assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());

    let names = overlay::archive::list(&first).unwrap();
    assert!(names.iter().any(|n| n == "opt/cyberxp/dashboard/static/app.js"));
}

#[test]
fn second_build_against_same_dir_is_rejected() {
    let h = Harness::new();
    let _held = BuildLock::acquire(&h.ctx.build_dir).unwrap();
    h.mounter.preload(h.ctx.layout().rootfs.join("proc"));

    let failure = h.run().unwrap_err();
    assert!(matches!(failure.error, BuildError::Locked { .. }));
    assert_eq!(failure.stage, State::Preflight);
    // The other run's mounts are not ours to touch.
    assert_eq!(h.mounter.active().len(), 1);
    assert!(h.fetcher.calls().is_empty());
}

#[test]
fn stale_mounts_from_killed_run_are_swept() {
    let h = Harness::new();
    let rootfs = h.ctx.layout().rootfs;
    h.mounter.preload(rootfs.join("proc"));
    h.mounter.preload(rootfs.join("dev/pts"));

    let summary = h.run().unwrap();
    assert!(summary.warnings.iter().any(|w| w.contains("2 stale mount(s)")));
    assert!(h.mounter.active().is_empty());
}
