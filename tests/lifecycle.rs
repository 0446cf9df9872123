//! Integration tests for the container registry: creation rules, the state
//! machine guards and persistence, exercised through the public API without
//! touching the kernel.

use porto::config::Config;
use porto::container::State;
use porto::cred::Cred;
use porto::error::ErrorKind;
use porto::holder::ContainerHolder;
use porto::kv::KvStore;
use porto::property;
use porto::volume::VolumeHolder;

fn holder(dir: &std::path::Path) -> ContainerHolder {
    ContainerHolder::new(KvStore::open(dir).unwrap()).unwrap()
}

#[test]
fn create_then_create_is_already_exists() {
    let dir = tempfile::tempdir().unwrap();
    let holder = holder(dir.path());
    let cfg = Config::default();

    holder.create("a", &Cred::root(), &cfg).unwrap();
    let err = holder.create("a", &Cred::root(), &cfg).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ContainerAlreadyExists);
    // the failed create changed nothing
    assert_eq!(holder.list(), vec!["a".to_string()]);
}

#[test]
fn stop_of_stopped_container_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let holder = holder(dir.path());
    let cfg = Config::default();

    holder.create("a", &Cred::root(), &cfg).unwrap();
    holder.stop("a", Some(&Cred::root()), &cfg).unwrap();
    holder.stop("a", Some(&Cred::root()), &cfg).unwrap();
    let a = holder.get("a").unwrap();
    assert_eq!(a.lock().unwrap().state, State::Stopped);
}

#[test]
fn name_length_depends_on_privilege() {
    let dir = tempfile::tempdir().unwrap();
    let holder = holder(dir.path());
    let cfg = Config::default();

    let long = "x".repeat(67);
    let err = holder
        .create(&long, &Cred::new(1000, 1000), &cfg)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidValue);
    holder.create(&long, &Cred::root(), &cfg).unwrap();
}

#[test]
fn properties_round_trip_through_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config::default();
    {
        let holder = holder(dir.path());
        let a = holder.create("a", &Cred::root(), &cfg).unwrap();
        let mut a = a.lock().unwrap();
        for (name, value) in &[
            (property::P_COMMAND, "sleep 1000"),
            (property::P_MEM_LIMIT, "16M"),
            (property::P_ISOLATE, "false"),
            (property::P_ENV, "A=1; B=2"),
        ] {
            a.set_property(name, value, &Cred::root(), &cfg).unwrap();
        }
        holder.save_container(&a, &cfg).unwrap();
    }

    // a fresh holder over the same store sees the same values
    let store = KvStore::open(dir.path()).unwrap();
    let record = store.load("a").unwrap();
    assert_eq!(record.get(property::P_COMMAND), Some("sleep 1000"));
    assert_eq!(record.get(property::P_MEM_LIMIT), Some(&(16 << 20).to_string()[..]));
    assert_eq!(record.get(property::P_ISOLATE), Some("false"));
    assert_eq!(record.get(property::P_ENV), Some("A=1; B=2"));
}

#[test]
fn dead_containers_report_exit_status() {
    let dir = tempfile::tempdir().unwrap();
    let holder = holder(dir.path());
    let cfg = Config::default();

    let a = holder.create("a", &Cred::root(), &cfg).unwrap();
    {
        let mut a = a.lock().unwrap();
        a.state = State::Running;
        a.wait_pid = 4321;
        a.task_pid = 4321;
    }
    // exit 42 arrives as the raw wait status
    assert_eq!(
        holder.deliver_exit(4321, 42 << 8, &cfg),
        Some("a".to_string())
    );
    let mut a = a.lock().unwrap();
    assert_eq!(a.state, State::Dead);
    assert_eq!(
        porto::data::get(&mut a, porto::data::D_EXIT_STATUS, &cfg)
            .unwrap()
            .as_int(),
        10752
    );
}

#[test]
fn destroy_without_start_leaves_no_record() {
    let dir = tempfile::tempdir().unwrap();
    let vdir = tempfile::tempdir().unwrap();
    let holder = holder(dir.path());
    let volumes = VolumeHolder::new(KvStore::open(vdir.path()).unwrap());
    let cfg = Config::default();

    holder.create("a", &Cred::root(), &cfg).unwrap();
    holder
        .destroy("a", &Cred::root(), &cfg, &volumes)
        .unwrap();
    let store = KvStore::open(dir.path()).unwrap();
    assert!(store.list().unwrap().is_empty());
    assert!(holder.get("a").is_err());
}

#[test]
fn guarantee_budget_is_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let holder = holder(dir.path());
    let cfg = Config::default();

    holder.create("a", &Cred::root(), &cfg).unwrap();
    // a guarantee bigger than any machine is rejected up front
    let err = holder
        .check_guarantee_budget("a", u64::MAX / 2, &cfg)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceNotAvailable);
    holder.check_guarantee_budget("a", 0, &cfg).unwrap();
}
