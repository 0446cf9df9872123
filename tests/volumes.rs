//! Integration tests for the volume registry and the layer store, kept to
//! the parts that work without mount privileges.

use std::path::Path;

use porto::config::Config;
use porto::cred::Cred;
use porto::error::ErrorKind;
use porto::kv::KvStore;
use porto::volume::VolumeHolder;

fn setup() -> (tempfile::TempDir, VolumeHolder, Config) {
    let dir = tempfile::tempdir().unwrap();
    let holder = VolumeHolder::new(KvStore::open(&dir.path().join("kv")).unwrap());
    let mut config = Config::default();
    config.volumes.volume_dir = dir.path().join("volumes");
    config.volumes.layers_dir = dir.path().join("layers");
    std::fs::create_dir_all(&config.volumes.layers_dir).unwrap();
    (dir, holder, config)
}

fn make_tarball(dir: &Path, name: &str) -> std::path::PathBuf {
    let content = dir.join("content");
    std::fs::create_dir_all(content.join("etc")).unwrap();
    std::fs::write(content.join("etc/os-release"), "NAME=test\n").unwrap();
    std::fs::write(content.join("etc/.wh.hosts"), "").unwrap();

    let path = dir.join(name);
    let file = std::fs::File::create(&path).unwrap();
    let mut builder = tar::Builder::new(file);
    builder.append_dir_all(".", &content).unwrap();
    builder.finish().unwrap();
    path
}

#[test]
fn layer_import_list_remove() {
    let (dir, holder, config) = setup();
    let tarball = make_tarball(dir.path(), "base.tar");

    holder
        .import_layer("base", &tarball, false, &config)
        .unwrap();
    assert_eq!(holder.list_layers(&config).unwrap(), vec!["base"]);
    // whiteouts are stripped on a plain import
    assert!(config
        .volumes
        .layers_dir
        .join("base/etc/os-release")
        .exists());
    assert!(!config.volumes.layers_dir.join("base/etc/.wh.hosts").exists());

    let err = holder
        .import_layer("base", &tarball, false, &config)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LayerAlreadyExists);
    holder.import_layer("base", &tarball, true, &config).unwrap();

    holder.remove_layer("base", &config).unwrap();
    assert!(holder.list_layers(&config).unwrap().is_empty());
    let err = holder.remove_layer("base", &config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LayerNotFound);
}

#[test]
fn missing_layers_fail_volume_creation() {
    let (_dir, holder, config) = setup();
    let spec = porto::volume::VolumeSpec {
        backend: Some("overlay".to_string()),
        layers: vec!["nope".to_string()],
        ..Default::default()
    };
    let err = holder.create(spec, &Cred::root(), &config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LayerNotFound);
}

#[test]
fn unknown_volume_operations_fail() {
    let (_dir, holder, config) = setup();
    let path = Path::new("/v/none");
    assert_eq!(
        holder.find(path).unwrap_err().kind(),
        ErrorKind::VolumeNotFound
    );
    assert_eq!(
        holder
            .destroy(path, &Cred::root(), &config)
            .unwrap_err()
            .kind(),
        ErrorKind::VolumeNotFound
    );
    assert_eq!(
        holder
            .link_container(path, "a", &Cred::root())
            .unwrap_err()
            .kind(),
        ErrorKind::VolumeNotFound
    );
}

#[test]
fn caller_supplied_paths_are_validated() {
    let (_dir, holder, config) = setup();
    let spec = porto::volume::VolumeSpec {
        path: Some("relative/path".into()),
        ..Default::default()
    };
    let err = holder.create(spec, &Cred::root(), &config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidValue);

    let spec = porto::volume::VolumeSpec {
        path: Some("/".into()),
        ..Default::default()
    };
    let err = holder.create(spec, &Cred::root(), &config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::VolumeAlreadyExists);
}
