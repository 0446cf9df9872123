//! The volume manager: one `Volume` per path, four backend strategies
//! behind one trait, a registry keyed by path, and the layer store used by
//! the overlay backend. Volumes are persisted and restored the same way
//! containers are; a volume lives as long as at least one container link.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use log::{info, warn};

use crate::config::Config;
use crate::cred::Cred;
use crate::error::{Error, ErrorKind, Result};
use crate::idmap::IdMap;
use crate::kv::{KvRecord, KvStore};
use crate::loopdev;
use crate::mount;
use crate::quota::{self, ProjectQuota};

pub const VOLUME_ID_MAX: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Bind mount of the storage directory.
    Plain,
    /// Project quota on the storage directory, then a bind mount.
    Native,
    /// An ext4 image on a loop device.
    Loop,
    /// Overlayfs over imported layers, upperdir under project quota.
    Overlay,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Plain => "plain",
            BackendKind::Native => "native",
            BackendKind::Loop => "loop",
            BackendKind::Overlay => "overlay",
        }
    }

    pub fn parse(s: &str) -> Result<BackendKind> {
        match s {
            "plain" => Ok(BackendKind::Plain),
            "native" => Ok(BackendKind::Native),
            "loop" => Ok(BackendKind::Loop),
            "overlay" => Ok(BackendKind::Overlay),
            other => Err(Error::new(
                ErrorKind::InvalidValue,
                format!("unknown volume backend {:?}", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VolumeStat {
    pub space_used: u64,
    pub space_avail: u64,
    pub inode_used: u64,
    pub inode_avail: u64,
}

/// Client-supplied creation parameters.
#[derive(Debug, Clone, Default)]
pub struct VolumeSpec {
    pub path: Option<PathBuf>,
    pub backend: Option<String>,
    pub storage: Option<PathBuf>,
    pub layers: Vec<String>,
    pub space_limit: u64,
    pub inode_limit: u64,
    pub read_only: bool,
    pub permissions: u32,
}

pub struct Volume {
    pub id: u32,
    pub path: PathBuf,
    pub backend: BackendKind,
    pub storage: PathBuf,
    /// Lower layer names, top to bottom (overlay only).
    pub layers: Vec<String>,
    /// Names of containers holding a link to this volume.
    pub containers: Vec<String>,
    pub cred: Cred,
    pub permissions: u32,
    pub space_limit: u64,
    pub inode_limit: u64,
    pub read_only: bool,
    pub ready: bool,
    /// Loop device number (loop backend only).
    pub loop_dev: i32,
}

impl Volume {
    pub fn check_permission(&self, client: &Cred) -> Result<()> {
        if client.can_control(&self.cred) {
            return Ok(());
        }
        Err(Error::new(
            ErrorKind::Permission,
            format!("volume {} is not owned by uid {}", self.path.display(), client.uid),
        ))
    }

    fn save(&self, store: &KvStore) -> Result<()> {
        let mut record = KvRecord::new(&self.id.to_string());
        record.set("path", self.path.display());
        record.set("backend", self.backend.name());
        record.set("storage", self.storage.display());
        record.set("layers", self.layers.join(";"));
        record.set("containers", self.containers.join(";"));
        record.set("uid", self.cred.uid);
        record.set("gid", self.cred.gid);
        record.set("permissions", format!("{:o}", self.permissions));
        record.set("space_limit", self.space_limit);
        record.set("inode_limit", self.inode_limit);
        record.set("read_only", self.read_only);
        record.set("ready", self.ready);
        record.set("_loop_dev", self.loop_dev);
        store.save(&record)
    }

    fn restore(record: &KvRecord) -> Result<Volume> {
        let id: u32 = record
            .name
            .parse()
            .map_err(|_| Error::new(ErrorKind::Unknown, "bad volume record name"))?;
        let get = |key: &str| -> Result<&str> {
            record.get(key).ok_or_else(|| {
                Error::new(
                    ErrorKind::Unknown,
                    format!("volume record {} lacks {}", record.name, key),
                )
            })
        };
        let split_list = |s: &str| -> Vec<String> {
            s.split(';')
                .filter(|t| !t.is_empty())
                .map(|t| t.to_string())
                .collect()
        };
        Ok(Volume {
            id,
            path: PathBuf::from(get("path")?),
            backend: BackendKind::parse(get("backend")?)?,
            storage: PathBuf::from(get("storage")?),
            layers: split_list(record.get("layers").unwrap_or("")),
            containers: split_list(record.get("containers").unwrap_or("")),
            cred: Cred::new(
                get("uid")?.parse().unwrap_or(0),
                get("gid")?.parse().unwrap_or(0),
            ),
            permissions: u32::from_str_radix(record.get("permissions").unwrap_or("775"), 8)
                .unwrap_or(0o775),
            space_limit: record.get("space_limit").unwrap_or("0").parse().unwrap_or(0),
            inode_limit: record.get("inode_limit").unwrap_or("0").parse().unwrap_or(0),
            read_only: record.get("read_only") == Some("true"),
            ready: record.get("ready") == Some("true"),
            loop_dev: record.get("_loop_dev").unwrap_or("-1").parse().unwrap_or(-1),
        })
    }

    fn chown_chmod(&self, path: &Path) -> Result<()> {
        nix::unistd::chown(
            path,
            Some(nix::unistd::Uid::from_raw(self.cred.uid)),
            Some(nix::unistd::Gid::from_raw(self.cred.gid)),
        )
        .map_err(|e| Error::from(e).context(format!("chown {}", path.display())))?;
        let mode = nix::sys::stat::Mode::from_bits_truncate(self.permissions);
        nix::sys::stat::fchmodat(
            None,
            path,
            mode,
            nix::sys::stat::FchmodatFlags::FollowSymlink,
        )
        .map_err(|e| Error::from(e).context(format!("chmod {}", path.display())))
    }
}

trait VolumeBackend {
    /// Early resource allocation, before anything touches the disk.
    fn configure(&self, _volume: &mut Volume) -> Result<()> {
        Ok(())
    }
    fn build(&self, volume: &mut Volume, config: &Config) -> Result<()>;
    fn clear(&self, volume: &Volume) -> Result<()>;
    fn destroy(&self, volume: &mut Volume) -> Result<()>;
    fn resize(&self, _volume: &mut Volume, _space: u64, _inodes: u64) -> Result<()> {
        Err(Error::new(
            ErrorKind::NotSupported,
            "backend does not support resize",
        ))
    }
    fn stat(&self, volume: &Volume) -> Result<VolumeStat> {
        let (space_avail, inode_avail) = quota::stat_fs(&volume.path)?;
        Ok(VolumeStat {
            space_used: 0,
            space_avail,
            inode_used: 0,
            inode_avail,
        })
    }
}

fn backend_for(kind: BackendKind) -> &'static dyn VolumeBackend {
    match kind {
        BackendKind::Plain => &PlainBackend,
        BackendKind::Native => &NativeBackend,
        BackendKind::Loop => &LoopBackend,
        BackendKind::Overlay => &OverlayBackend,
    }
}

/* plain: bind mount of the storage directory */

struct PlainBackend;

impl VolumeBackend for PlainBackend {
    fn build(&self, volume: &mut Volume, _config: &Config) -> Result<()> {
        volume.chown_chmod(&volume.storage)?;
        mount::bind_mount(&volume.storage, &volume.path, volume.read_only)
    }

    fn clear(&self, volume: &Volume) -> Result<()> {
        clear_directory(&volume.storage)
    }

    fn destroy(&self, volume: &mut Volume) -> Result<()> {
        if let Err(e) = mount::umount(&volume.path) {
            warn!("cannot umount volume: {}", e);
        }
        Ok(())
    }
}

/* native: project quota on the storage directory, then a bind mount */

struct NativeBackend;

impl VolumeBackend for NativeBackend {
    fn build(&self, volume: &mut Volume, _config: &Config) -> Result<()> {
        let project = ProjectQuota::new(&volume.storage)?;
        project.create(volume.space_limit, volume.inode_limit)?;
        volume.chown_chmod(&volume.storage)?;
        mount::bind_mount(&volume.storage, &volume.path, volume.read_only)
    }

    fn clear(&self, volume: &Volume) -> Result<()> {
        clear_directory(&volume.storage)
    }

    fn destroy(&self, volume: &mut Volume) -> Result<()> {
        if let Err(e) = mount::umount(&volume.path) {
            warn!("cannot umount volume: {}", e);
        }
        match ProjectQuota::new(&volume.storage) {
            Ok(project) => {
                if let Err(e) = project.destroy() {
                    warn!("cannot destroy project quota: {}", e);
                }
            }
            Err(e) => warn!("cannot open project quota: {}", e),
        }
        Ok(())
    }

    fn resize(&self, volume: &mut Volume, space: u64, inodes: u64) -> Result<()> {
        let project = ProjectQuota::new(&volume.storage)?;
        project.resize(space, inodes)?;
        volume.space_limit = space;
        volume.inode_limit = inodes;
        Ok(())
    }

    fn stat(&self, volume: &Volume) -> Result<VolumeStat> {
        let project = ProjectQuota::new(&volume.storage)?;
        let (space_used, space_limit, inode_used, inode_limit) = project.usage()?;
        Ok(VolumeStat {
            space_used,
            space_avail: space_limit.saturating_sub(space_used),
            inode_used,
            inode_avail: inode_limit.saturating_sub(inode_used),
        })
    }
}

/* loop: ext4 image on a loop device */

struct LoopBackend;

impl LoopBackend {
    fn image_path(volume: &Volume) -> PathBuf {
        volume.storage.join("loop.img")
    }
}

impl VolumeBackend for LoopBackend {
    fn configure(&self, volume: &mut Volume) -> Result<()> {
        if volume.space_limit == 0 {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                "loop backend requires a space limit",
            ));
        }
        if volume.loop_dev < 0 {
            volume.loop_dev = loopdev::get_free()?;
        }
        Ok(())
    }

    fn build(&self, volume: &mut Volume, _config: &Config) -> Result<()> {
        let image = Self::image_path(volume);
        loopdev::alloc_image(&image, volume.space_limit)?;
        loopdev::attach(volume.loop_dev, &image)?;
        loopdev::mount(volume.loop_dev, &volume.path, volume.read_only)?;
        volume.chown_chmod(&volume.path)
    }

    fn clear(&self, volume: &Volume) -> Result<()> {
        clear_directory(&volume.path)
    }

    fn destroy(&self, volume: &mut Volume) -> Result<()> {
        if let Err(e) = mount::umount(&volume.path) {
            warn!("cannot umount volume: {}", e);
        }
        if volume.loop_dev >= 0 {
            if let Err(e) = loopdev::detach(volume.loop_dev) {
                warn!("cannot detach loop device: {}", e);
            }
            volume.loop_dev = -1;
        }
        Ok(())
    }
}

/* overlay: overlayfs over the layer store, upperdir under project quota */

struct OverlayBackend;

impl VolumeBackend for OverlayBackend {
    fn build(&self, volume: &mut Volume, config: &Config) -> Result<()> {
        let upper = volume.storage.join("upper");
        let work = volume.storage.join("work");

        if config.volumes.enable_quota && quota::supported(&volume.storage) {
            let project = ProjectQuota::new(&volume.storage)?;
            project.create(volume.space_limit, volume.inode_limit)?;
        }

        let result = (|| -> Result<()> {
            fs::create_dir_all(&upper)?;
            fs::create_dir_all(&work)?;
            volume.chown_chmod(&upper)?;

            let lower = volume
                .layers
                .iter()
                .map(|layer| config.volumes.layers_dir.join(layer).display().to_string())
                .collect::<Vec<_>>()
                .join(":");
            let data = format!(
                "lowerdir={},upperdir={},workdir={}",
                lower,
                upper.display(),
                work.display()
            );
            let mut flags = nix::mount::MsFlags::empty();
            if volume.read_only {
                flags |= nix::mount::MsFlags::MS_RDONLY;
            }
            mount::mount_fs("overlay", &volume.path, "overlay", flags, &data)
        })();

        if result.is_err() {
            if let Ok(project) = ProjectQuota::new(&volume.storage) {
                let _ = project.destroy();
            }
        }
        result
    }

    fn clear(&self, volume: &Volume) -> Result<()> {
        clear_directory(&volume.storage.join("upper"))
    }

    fn destroy(&self, volume: &mut Volume) -> Result<()> {
        if let Err(e) = mount::umount(&volume.path) {
            warn!("cannot umount overlay: {}", e);
        }
        if let Err(e) = clear_directory(&volume.storage) {
            warn!("cannot clear overlay storage: {}", e);
        }
        if let Ok(project) = ProjectQuota::new(&volume.storage) {
            let _ = project.destroy();
        }
        Ok(())
    }

    fn resize(&self, volume: &mut Volume, space: u64, inodes: u64) -> Result<()> {
        let project = ProjectQuota::new(&volume.storage)?;
        project.resize(space, inodes)?;
        volume.space_limit = space;
        volume.inode_limit = inodes;
        Ok(())
    }
}

fn clear_directory(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let p = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&p)?;
        } else {
            fs::remove_file(&p)?;
        }
    }
    Ok(())
}

/// Registry of volumes keyed by path; owns the id bitmap and persistence.
pub struct VolumeHolder {
    volumes: RwLock<BTreeMap<PathBuf, Arc<Mutex<Volume>>>>,
    ids: Mutex<IdMap>,
    store: KvStore,
}

impl VolumeHolder {
    pub fn new(store: KvStore) -> VolumeHolder {
        VolumeHolder {
            volumes: RwLock::new(BTreeMap::new()),
            ids: Mutex::new(IdMap::new(1, VOLUME_ID_MAX)),
            store,
        }
    }

    /// The whole §creation flow: resolve path, pick backend, prepare
    /// storage, configure, build, register. Returns the volume path.
    pub fn create(&self, spec: VolumeSpec, client: &Cred, config: &Config) -> Result<PathBuf> {
        let id = self.ids.lock().unwrap().get()?;
        let result = self.create_with_id(id, spec, client, config);
        if result.is_err() {
            self.ids.lock().unwrap().put(id);
        }
        result
    }

    fn create_with_id(
        &self,
        id: u32,
        spec: VolumeSpec,
        client: &Cred,
        config: &Config,
    ) -> Result<PathBuf> {
        let auto_dir = config.volumes.volume_dir.join(id.to_string());
        let path = match &spec.path {
            Some(path) => {
                if !path.is_absolute() {
                    return Err(Error::new(
                        ErrorKind::InvalidValue,
                        "volume path must be absolute",
                    ));
                }
                if path.exists() {
                    return Err(Error::new(
                        ErrorKind::VolumeAlreadyExists,
                        format!("path {} already exists", path.display()),
                    ));
                }
                check_parent_writable(path, client)?;
                path.clone()
            }
            None => auto_dir.join("volume"),
        };

        {
            let volumes = self.volumes.read().unwrap();
            if volumes.contains_key(&path) {
                return Err(Error::new(
                    ErrorKind::VolumeAlreadyExists,
                    format!("volume {} already exists", path.display()),
                ));
            }
        }

        let backend = match &spec.backend {
            Some(name) => BackendKind::parse(name)?,
            None => {
                if !spec.layers.is_empty() {
                    BackendKind::Overlay
                } else if config.volumes.enable_quota
                    && quota::supported(&config.volumes.volume_dir)
                {
                    BackendKind::Native
                } else if spec.space_limit > 0 {
                    BackendKind::Loop
                } else {
                    BackendKind::Plain
                }
            }
        };

        if backend == BackendKind::Overlay {
            for layer in &spec.layers {
                if !config.volumes.layers_dir.join(layer).exists() {
                    return Err(Error::new(
                        ErrorKind::LayerNotFound,
                        format!("layer {} not found", layer),
                    ));
                }
            }
        }

        let storage = match &spec.storage {
            Some(storage) => {
                check_parent_writable(storage, client)?;
                storage.clone()
            }
            None => auto_dir.join(backend.name()),
        };

        fs::create_dir_all(&storage)
            .map_err(|e| Error::from(e).context(format!("create {}", storage.display())))?;
        fs::create_dir_all(&path)
            .map_err(|e| Error::from(e).context(format!("create {}", path.display())))?;

        let mut volume = Volume {
            id,
            path: path.clone(),
            backend,
            storage,
            layers: spec.layers,
            containers: vec![],
            cred: client.clone(),
            permissions: if spec.permissions != 0 {
                spec.permissions
            } else {
                0o775
            },
            space_limit: spec.space_limit,
            inode_limit: spec.inode_limit,
            read_only: spec.read_only,
            ready: false,
            loop_dev: -1,
        };

        let backend_impl = backend_for(backend);
        backend_impl.configure(&mut volume)?;
        if let Err(e) = backend_impl.build(&mut volume, config) {
            let _ = backend_impl.destroy(&mut volume);
            let _ = fs::remove_dir_all(&auto_dir);
            return Err(e);
        }
        volume.ready = true;
        volume.save(&self.store)?;
        info!("created volume {} backend {}", path.display(), backend.name());

        let mut volumes = self.volumes.write().unwrap();
        volumes.insert(path.clone(), Arc::new(Mutex::new(volume)));
        Ok(path)
    }

    pub fn find(&self, path: &Path) -> Result<Arc<Mutex<Volume>>> {
        let volumes = self.volumes.read().unwrap();
        volumes.get(path).cloned().ok_or_else(|| {
            Error::new(
                ErrorKind::VolumeNotFound,
                format!("volume {} not found", path.display()),
            )
        })
    }

    pub fn list_paths(&self) -> Vec<PathBuf> {
        self.volumes.read().unwrap().keys().cloned().collect()
    }

    /// Volumes holding a link to the named container.
    pub fn linked_to(&self, container: &str) -> Vec<PathBuf> {
        let volumes = self.volumes.read().unwrap();
        volumes
            .iter()
            .filter(|(_, v)| {
                v.lock()
                    .unwrap()
                    .containers
                    .iter()
                    .any(|c| c == container)
            })
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub fn destroy(&self, path: &Path, client: &Cred, config: &Config) -> Result<()> {
        let volume = self.find(path)?;
        {
            let volume = volume.lock().unwrap();
            volume.check_permission(client)?;
        }
        self.destroy_internal(path, config)
    }

    fn destroy_internal(&self, path: &Path, config: &Config) -> Result<()> {
        let volume = self.find(path)?;
        let id;
        {
            let mut volume = volume.lock().unwrap();
            volume.ready = false;
            id = volume.id;
            let backend_impl = backend_for(volume.backend);
            backend_impl.destroy(&mut volume)?;
            let auto_dir = config.volumes.volume_dir.join(id.to_string());
            let _ = fs::remove_dir_all(&auto_dir);
            let _ = fs::remove_dir(&volume.path);
            self.store.remove(&id.to_string())?;
        }
        self.volumes.write().unwrap().remove(path);
        self.ids.lock().unwrap().put(id);
        info!("destroyed volume {}", path.display());
        Ok(())
    }

    pub fn link_container(&self, path: &Path, container: &str, client: &Cred) -> Result<()> {
        let volume = self.find(path)?;
        let mut volume = volume.lock().unwrap();
        volume.check_permission(client)?;
        if !volume.ready {
            return Err(Error::new(ErrorKind::VolumeNotReady, "volume is not ready"));
        }
        if volume.containers.iter().any(|c| c == container) {
            return Err(Error::new(
                ErrorKind::Busy,
                format!("container {} is already linked", container),
            ));
        }
        volume.containers.push(container.to_string());
        volume.save(&self.store)
    }

    /// Remove one link; the last link destroys the volume.
    pub fn unlink_container(
        &self,
        path: &Path,
        container: &str,
        client: Option<&Cred>,
        config: &Config,
    ) -> Result<()> {
        let destroy = {
            let volume = self.find(path)?;
            let mut volume = volume.lock().unwrap();
            if let Some(client) = client {
                volume.check_permission(client)?;
            }
            let before = volume.containers.len();
            volume.containers.retain(|c| c != container);
            if volume.containers.len() == before {
                return Err(Error::new(
                    ErrorKind::VolumeNotFound,
                    format!("container {} is not linked", container),
                ));
            }
            volume.save(&self.store)?;
            volume.containers.is_empty()
        };
        if destroy {
            self.destroy_internal(path, config)?;
        }
        Ok(())
    }

    pub fn resize(
        &self,
        path: &Path,
        space: u64,
        inodes: u64,
        client: &Cred,
    ) -> Result<()> {
        let volume = self.find(path)?;
        let mut volume = volume.lock().unwrap();
        volume.check_permission(client)?;
        let backend_impl = backend_for(volume.backend);
        backend_impl.resize(&mut volume, space, inodes)?;
        volume.save(&self.store)
    }

    pub fn stat(&self, path: &Path) -> Result<VolumeStat> {
        let volume = self.find(path)?;
        let volume = volume.lock().unwrap();
        backend_for(volume.backend).stat(&volume)
    }

    /// Load every record, reattach ready volumes, clean up the rest.
    pub fn restore(&self, config: &Config) -> Result<()> {
        for name in self.store.list()? {
            let record = match self.store.load(&name) {
                Ok(record) => record,
                Err(e) => {
                    warn!("cannot load volume record {}: {}", name, e);
                    continue;
                }
            };
            let volume = match Volume::restore(&record) {
                Ok(volume) => volume,
                Err(e) => {
                    warn!("cannot restore volume record {}: {}", name, e);
                    let _ = self.store.remove(&name);
                    continue;
                }
            };
            if self.ids.lock().unwrap().get_at(volume.id).is_err() {
                warn!("volume record {} has a conflicting id, dropped", name);
                let _ = self.store.remove(&name);
                continue;
            }
            if !volume.ready {
                info!("dropping unfinished volume {}", volume.path.display());
                let mut volume = volume;
                let _ = backend_for(volume.backend).destroy(&mut volume);
                let _ = self.store.remove(&name);
                self.ids.lock().unwrap().put(volume.id);
                continue;
            }
            info!("restored volume {}", volume.path.display());
            self.volumes
                .write()
                .unwrap()
                .insert(volume.path.clone(), Arc::new(Mutex::new(volume)));
        }
        let _ = config;
        Ok(())
    }

    // ------------------------------------------------------------------
    // layers

    pub fn import_layer(
        &self,
        name: &str,
        tarball: &Path,
        merge: bool,
        config: &Config,
    ) -> Result<()> {
        valid_layer_name(name)?;
        let dir = config.volumes.layers_dir.join(name);
        if dir.exists() && !merge {
            return Err(Error::new(
                ErrorKind::LayerAlreadyExists,
                format!("layer {} already exists", name),
            ));
        }
        fs::create_dir_all(&dir)?;
        let file = fs::File::open(tarball)
            .map_err(|e| Error::from(e).context(format!("open {}", tarball.display())))?;
        let mut archive = tar::Archive::new(file);
        archive.set_preserve_permissions(true);
        archive
            .unpack(&dir)
            .map_err(|e| Error::from(e).context(format!("unpack {}", tarball.display())))?;
        sanitize_layer(&dir, merge)?;
        info!("imported layer {}", name);
        Ok(())
    }

    pub fn export_layer(&self, volume_path: &Path, tarball: &Path) -> Result<()> {
        let volume = self.find(volume_path)?;
        let volume = volume.lock().unwrap();
        let source = match volume.backend {
            BackendKind::Overlay => volume.storage.join("upper"),
            _ => volume.storage.clone(),
        };
        let file = fs::File::create(tarball)
            .map_err(|e| Error::from(e).context(format!("create {}", tarball.display())))?;
        let mut builder = tar::Builder::new(file);
        builder
            .append_dir_all(".", &source)
            .map_err(|e| Error::from(e).context("archive layer"))?;
        builder.finish().map_err(|e| Error::from(e).context("archive layer"))?;
        Ok(())
    }

    pub fn remove_layer(&self, name: &str, config: &Config) -> Result<()> {
        valid_layer_name(name)?;
        if self.layer_in_use(name) {
            return Err(Error::new(
                ErrorKind::Busy,
                format!("layer {} is in use", name),
            ));
        }
        let dir = config.volumes.layers_dir.join(name);
        if !dir.exists() {
            return Err(Error::new(
                ErrorKind::LayerNotFound,
                format!("layer {} not found", name),
            ));
        }
        fs::remove_dir_all(&dir)
            .map_err(|e| Error::from(e).context(format!("remove layer {}", name)))?;
        Ok(())
    }

    pub fn list_layers(&self, config: &Config) -> Result<Vec<String>> {
        let mut layers = vec![];
        let dir = &config.volumes.layers_dir;
        if !dir.exists() {
            return Ok(layers);
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                layers.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        layers.sort();
        Ok(layers)
    }

    /// A layer is busy while any ready volume stacks on it.
    fn layer_in_use(&self, name: &str) -> bool {
        let volumes = self.volumes.read().unwrap();
        volumes.values().any(|v| {
            let v = v.lock().unwrap();
            v.ready && v.layers.iter().any(|l| l == name)
        })
    }
}

fn check_parent_writable(path: &Path, client: &Cred) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        Error::new(ErrorKind::InvalidValue, "volume path has no parent")
    })?;
    if !parent.exists() {
        return Err(Error::new(
            ErrorKind::InvalidValue,
            format!("{} does not exist", parent.display()),
        ));
    }
    if client.is_root() {
        return Ok(());
    }
    use std::os::linux::fs::MetadataExt;
    let meta = fs::metadata(parent)?;
    let mode = meta.st_mode();
    let writable = (meta.st_uid() == client.uid && mode & 0o200 != 0)
        || (client.member_of(meta.st_gid()) && mode & 0o020 != 0)
        || mode & 0o002 != 0;
    if !writable {
        return Err(Error::new(
            ErrorKind::Permission,
            format!("no write access to {}", parent.display()),
        ));
    }
    Ok(())
}

fn valid_layer_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-.".contains(c))
    {
        return Err(Error::new(
            ErrorKind::InvalidValue,
            format!("invalid layer name {:?}", name),
        ));
    }
    Ok(())
}

/// Remove overlayfs whiteouts from an imported layer. Merging keeps them:
/// they mask lower-layer files on purpose.
fn sanitize_layer(dir: &Path, merge: bool) -> Result<()> {
    if merge {
        return Ok(());
    }
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if entry.file_type()?.is_dir() {
                stack.push(entry.path());
            } else if name.starts_with(".wh.") {
                fs::remove_file(entry.path())?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_names() {
        assert!(valid_layer_name("base-image_v1.2").is_ok());
        assert!(valid_layer_name("").is_err());
        assert!(valid_layer_name("../escape").is_err());
        assert!(valid_layer_name("with space").is_err());
    }

    #[test]
    fn backend_names_round_trip() {
        for kind in &[
            BackendKind::Plain,
            BackendKind::Native,
            BackendKind::Loop,
            BackendKind::Overlay,
        ] {
            assert_eq!(BackendKind::parse(kind.name()).unwrap(), *kind);
        }
        assert!(BackendKind::parse("zfs").is_err());
    }

    #[test]
    fn record_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path()).unwrap();
        let volume = Volume {
            id: 7,
            path: PathBuf::from("/v/auto"),
            backend: BackendKind::Overlay,
            storage: PathBuf::from("/place/porto_volumes/7/overlay"),
            layers: vec!["base".to_string(), "app".to_string()],
            containers: vec!["a".to_string()],
            cred: Cred::new(1000, 1000),
            permissions: 0o775,
            space_limit: 1 << 30,
            inode_limit: 0,
            read_only: false,
            ready: true,
            loop_dev: -1,
        };
        volume.save(&store).unwrap();
        let record = store.load("7").unwrap();
        let restored = Volume::restore(&record).unwrap();
        assert_eq!(restored.path, volume.path);
        assert_eq!(restored.backend, BackendKind::Overlay);
        assert_eq!(restored.layers, volume.layers);
        assert_eq!(restored.containers, volume.containers);
        assert_eq!(restored.space_limit, 1 << 30);
        assert!(restored.ready);
    }

    #[test]
    fn whiteouts_are_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("etc")).unwrap();
        fs::write(dir.path().join("etc/.wh.passwd"), "").unwrap();
        fs::write(dir.path().join("kept"), "data").unwrap();
        sanitize_layer(dir.path(), false).unwrap();
        assert!(!dir.path().join("etc/.wh.passwd").exists());
        assert!(dir.path().join("kept").exists());

        fs::write(dir.path().join("etc/.wh.shadow"), "").unwrap();
        sanitize_layer(dir.path(), true).unwrap();
        assert!(dir.path().join("etc/.wh.shadow").exists());
    }

    #[test]
    fn links_guard_ready_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path()).unwrap();
        let holder = VolumeHolder::new(store);
        let volume = Volume {
            id: 1,
            path: PathBuf::from("/v/test"),
            backend: BackendKind::Plain,
            storage: PathBuf::from("/tmp/storage"),
            layers: vec![],
            containers: vec![],
            cred: Cred::root(),
            permissions: 0o775,
            space_limit: 0,
            inode_limit: 0,
            read_only: false,
            ready: false,
            loop_dev: -1,
        };
        holder
            .volumes
            .write()
            .unwrap()
            .insert(volume.path.clone(), Arc::new(Mutex::new(volume)));

        let err = holder
            .link_container(Path::new("/v/test"), "a", &Cred::root())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VolumeNotReady);

        holder
            .find(Path::new("/v/test"))
            .unwrap()
            .lock()
            .unwrap()
            .ready = true;
        holder
            .link_container(Path::new("/v/test"), "a", &Cred::root())
            .unwrap();
        assert_eq!(holder.linked_to("a"), vec![PathBuf::from("/v/test")]);
        let err = holder
            .link_container(Path::new("/v/test"), "a", &Cred::root())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
    }
}
