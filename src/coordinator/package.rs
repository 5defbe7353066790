//! Builds the role-appropriate install package for one follower host.
//!
//! Archive layout:
//!
//! ```text
//! crypto-config/{peer|orderer}Organizations/{domain}/{peers|orderers}/{host}
//! peer/    bundle of the PEER role, from {init_dir}/bundles/peer-{ip}
//! order/   bundle of the ORDERER role, from {init_dir}/bundles/order-{ip}
//! tools/   optional, from {init_dir}/tools/{os}
//! ```

use std::{
    fs::File,
    path::{Path, PathBuf},
};

use flate2::{Compression, write::GzEncoder};
use tracing::{info, warn};

use crate::{
    FleetError, Result,
    coordinator::roles::FleetLayout,
    protocol::OsType,
    utils,
};

pub const CRYPTO_CONFIG_DIR: &str = "crypto-config";
const BUNDLES_DIR: &str = "bundles";
const TOOLS_DIR: &str = "tools";

pub struct PackageBuilder {
    init_dir: PathBuf,
    out_dir: PathBuf,
}

impl PackageBuilder {
    pub fn new(
        init_dir: impl Into<PathBuf>,
        out_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            init_dir: init_dir.into(),
            out_dir: out_dir.into(),
        }
    }

    /// Packs the bundles and credentials of every node the layout places on `ip`.
    ///
    /// Missing bundle directories are skipped; an archive with nothing in it
    /// is an error. Each host keeps one archive per os type: a rebuild is
    /// written aside and renamed over it, so a download still streaming the
    /// previous one is unaffected.
    pub async fn build(
        &self,
        layout: &FleetLayout,
        ip: &str,
        os: OsType,
    ) -> Result<PathBuf> {
        let entries = self.entries(layout, ip, os);
        if entries.is_empty() {
            return Err(FleetError::Package(format!("nothing to pack for {}", ip)));
        }

        tokio::fs::create_dir_all(&self.out_dir).await?;
        let target = self.out_dir.join(format!("{}-{}.tar.gz", ip, os.as_ref()));
        let partial = self.out_dir.join(format!(".{}-{}.part", ip, utils::longid()));
        info!("package::build({}) {} entries -> {:?}", ip, entries.len(), target);

        let path = partial.clone();
        let written = match tokio::task::spawn_blocking(move || write_archive(&path, &entries)).await {
            Ok(written) => written,
            Err(err) => Err(err.into()),
        };
        if let Err(err) = written {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(err);
        }
        tokio::fs::rename(&partial, &target).await?;
        Ok(target)
    }

    /// `(source dir, archive dir)` pairs that exist on disk.
    fn entries(
        &self,
        layout: &FleetLayout,
        ip: &str,
        os: OsType,
    ) -> Vec<(PathBuf, String)> {
        let nodes = layout.nodes_at(ip);
        let mut entries = Vec::new();

        let mut roles = nodes.iter().map(|n| n.role).collect::<Vec<_>>();
        roles.dedup();
        for role in roles {
            let src = self.init_dir.join(BUNDLES_DIR).join(format!("{}-{}", role.folder_name(), ip));
            if src.is_dir() {
                entries.push((src, role.folder_name().to_string()));
            } else {
                warn!("package::build({}) missing {} bundle at {:?}", ip, role, src);
            }
        }

        for node in nodes.iter() {
            let relative = format!("{}/{}/{}/{}", node.role.org_dir(), layout.domain(node.role), node.role.node_dir(), node.host_name);
            let src = self.init_dir.join(CRYPTO_CONFIG_DIR).join(&relative);
            if src.is_dir() {
                entries.push((src, format!("{}/{}", CRYPTO_CONFIG_DIR, relative)));
            } else {
                warn!("package::build({}) missing credentials of {} at {:?}", ip, node.host_name, src);
            }
        }

        let tools = self.init_dir.join(TOOLS_DIR).join(os.as_ref());
        if tools.is_dir() && !entries.is_empty() {
            entries.push((tools, TOOLS_DIR.to_string()));
        }
        entries
    }
}

fn write_archive(
    target: &Path,
    entries: &[(PathBuf, String)],
) -> Result<()> {
    let file = File::create(target)?;
    let mut archive = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for (src, name) in entries.iter() {
        archive.append_dir_all(name, src)?;
    }
    archive.into_inner()?.finish()?;
    Ok(())
}

/// Unpacks a package produced by [`PackageBuilder`] into `dest`.
pub async fn unpack(
    package: PathBuf,
    dest: PathBuf,
) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        std::fs::create_dir_all(&dest)?;
        let file = File::open(&package).map_err(|err| FleetError::Package(format!("cannot open package {:?}: {}", package, err)))?;
        tar::Archive::new(flate2::read::GzDecoder::new(file))
            .unpack(&dest)
            .map_err(|err| FleetError::Package(format!("cannot unpack {:?}: {}", package, err)))
    })
    .await?
}
