//! Domain disk, cloud-init image, and definition management.
//!
//! Building a domain:
//! 1. Render cloud-config and network-config into the scratch directory
//! 2. `cloud-localds` packs them into `<vm_dir>/<id>-cloudinit.iso`
//! 3. `qemu-img create` makes `<vm_dir>/<id>-disk.qcow2` backed by the base
//!    image, then `qemu-img resize` grows it to the requested size
//! 4. `virt-install --import` defines and boots the domain with autostart
//!
//! A domain already listed by `virsh list --all` is left untouched.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use vmfleet_message::VmSpec;

use super::templates::{render_cloud_config, render_network_config};
use super::{ProvisionConfig, ProvisionError};
use crate::command::{self, CommandError};

/// Size of the base images; the domain disk is grown by the remainder.
const BASE_IMAGE_GIB: u32 = 2;

/// File locations for one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainPaths {
    pub disk: PathBuf,
    pub cloudinit_iso: PathBuf,
    pub backing_image: PathBuf,
    pub cloud_config: PathBuf,
    pub network_config: PathBuf,
}

impl DomainPaths {
    pub fn new(config: &ProvisionConfig, spec: &VmSpec) -> Self {
        Self {
            disk: config.vm_dir.join(format!("{}-disk.qcow2", spec.id)),
            cloudinit_iso: config.vm_dir.join(format!("{}-cloudinit.iso", spec.id)),
            backing_image: config.image_dir.join(format!("{}.qcow2", spec.os_image)),
            cloud_config: config
                .scratch_dir
                .join(format!("{}-cloud-config.yml", spec.id)),
            network_config: config
                .scratch_dir
                .join(format!("{}-network-config.yml", spec.id)),
        }
    }
}

/// Arguments for `cloud-localds`.
pub fn cloud_localds_args(paths: &DomainPaths) -> Vec<String> {
    vec![
        "-v".to_string(),
        format!("--network-config={}", paths.network_config.display()),
        paths.cloudinit_iso.display().to_string(),
        paths.cloud_config.display().to_string(),
    ]
}

/// Arguments for `qemu-img create`.
pub fn qemu_img_create_args(paths: &DomainPaths) -> Vec<String> {
    vec![
        "create".to_string(),
        "-f".to_string(),
        "qcow2".to_string(),
        "-F".to_string(),
        "qcow2".to_string(),
        "-o".to_string(),
        format!("backing_file={}", paths.backing_image.display()),
        paths.disk.display().to_string(),
    ]
}

/// Arguments for `virt-install`.
pub fn virt_install_args(config: &ProvisionConfig, spec: &VmSpec, paths: &DomainPaths) -> Vec<String> {
    vec![
        "--connect".to_string(),
        config.connect_uri.clone(),
        "--boot".to_string(),
        "uefi".to_string(),
        "--arch".to_string(),
        config.guest_arch.clone(),
        "--name".to_string(),
        spec.id.clone(),
        "--description".to_string(),
        spec.console_password.to_string(),
        "--memory".to_string(),
        (u64::from(spec.memory_gib) * 1024).to_string(),
        "--vcpus".to_string(),
        spec.vcpus.to_string(),
        "--network".to_string(),
        format!("bridge={},model=virtio", spec.bridge_name()),
        "--import".to_string(),
        "--disk".to_string(),
        format!("path={},bus=virtio", paths.disk.display()),
        "--disk".to_string(),
        format!("path={},device=cdrom", paths.cloudinit_iso.display()),
        "--nographics".to_string(),
        "--noautoconsole".to_string(),
        "--autostart".to_string(),
    ]
}

pub(super) async fn ensure_domain(
    config: &ProvisionConfig,
    spec: &VmSpec,
) -> Result<(), ProvisionError> {
    validate(spec)?;

    if is_defined(config, spec).await? {
        debug!(domain = %spec.id, "Domain already defined");
        return Ok(());
    }

    let paths = DomainPaths::new(config, spec);
    info!(
        domain = %spec.id,
        os_image = %spec.os_image,
        memory_gib = spec.memory_gib,
        vcpus = spec.vcpus,
        disk_gib = spec.disk_gib,
        bridge = %spec.bridge_name(),
        "Provisioning domain"
    );

    write_file(spec, &paths.cloud_config, render_cloud_config(spec)).await?;
    write_file(spec, &paths.network_config, render_network_config(spec)).await?;

    run(spec, "cloud-localds", &cloud_localds_args(&paths)).await?;
    run(spec, "qemu-img", &qemu_img_create_args(&paths)).await?;

    let grow_by = spec.disk_gib.saturating_sub(BASE_IMAGE_GIB);
    if grow_by > 0 {
        let size = format!("+{grow_by}G");
        run(
            spec,
            "qemu-img",
            &["resize".to_string(), paths.disk.display().to_string(), size],
        )
        .await?;
    }

    run(spec, "virt-install", &virt_install_args(config, spec, &paths)).await?;

    info!(domain = %spec.id, "Domain provisioned");
    Ok(())
}

pub(super) async fn remove_domain(
    config: &ProvisionConfig,
    spec: &VmSpec,
) -> Result<(), ProvisionError> {
    validate(spec)?;

    if is_defined(config, spec).await? {
        info!(domain = %spec.id, "Removing domain");
        // Fails when the domain is not running, which is fine.
        command::run_best_effort("virsh", &virsh_args(config, &["destroy", spec.id.as_str()])).await;
        run(
            spec,
            "virsh",
            &virsh_args(config, &["undefine", "--nvram", spec.id.as_str()]),
        )
        .await?;
    } else {
        debug!(domain = %spec.id, "Domain not defined, removing leftover files only");
    }

    let paths = DomainPaths::new(config, spec);
    for path in [&paths.disk, &paths.cloudinit_iso] {
        remove_file(spec, path).await?;
    }

    Ok(())
}

async fn is_defined(config: &ProvisionConfig, spec: &VmSpec) -> Result<bool, ProvisionError> {
    let listing = run(
        spec,
        "virsh",
        &virsh_args(config, &["list", "--all", "--name"]),
    )
    .await?;
    Ok(listing.lines().any(|line| line.trim() == spec.id))
}

fn virsh_args(config: &ProvisionConfig, args: &[&str]) -> Vec<String> {
    let mut full = vec!["-c".to_string(), config.connect_uri.clone()];
    full.extend(args.iter().map(|a| a.to_string()));
    full
}

fn validate(spec: &VmSpec) -> Result<(), ProvisionError> {
    if spec.id.is_empty() {
        return Err(ProvisionError::InvalidSpec("empty domain id".to_string()));
    }
    if spec.id.contains('/') || spec.id.starts_with('.') || spec.id.contains(char::is_whitespace) {
        return Err(ProvisionError::InvalidSpec(format!(
            "domain id {:?} is not a valid file name",
            spec.id
        )));
    }
    Ok(())
}

async fn run(spec: &VmSpec, program: &str, args: &[String]) -> Result<String, ProvisionError> {
    command::run(program, args)
        .await
        .map_err(|source: CommandError| ProvisionError::Command {
            domain: spec.id.clone(),
            source,
        })
}

async fn write_file(spec: &VmSpec, path: &Path, content: String) -> Result<(), ProvisionError> {
    tokio::fs::write(path, content)
        .await
        .map_err(|source| ProvisionError::Io {
            domain: spec.id.clone(),
            path: path.to_path_buf(),
            source,
        })
}

async fn remove_file(spec: &VmSpec, path: &Path) -> Result<(), ProvisionError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(domain = %spec.id, path = %path.display(), "Removed domain file");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => {
            warn!(domain = %spec.id, path = %path.display(), error = %source, "Failed to remove domain file");
            Err(ProvisionError::Io {
                domain: spec.id.clone(),
                path: path.to_path_buf(),
                source,
            })
        }
    }
}
