use podscope::domain::ContainerQos;
use podscope::inventory::{
    cgroupfs_to_systemd, container_cgroup_suffix, systemd_to_cgroupfs, CgroupDriver,
};

#[test]
fn test_burstable_systemd_slice_expansion() {
    let suffix = container_cgroup_suffix(
        CgroupDriver::Systemd,
        "0123456789abcdef",
        "1234-abcd-5678",
        ContainerQos::Burstable,
    );
    assert_eq!(
        suffix,
        "/kubepods.slice/kubepods-burstable.slice/kubepods-burstable-pod1234_abcd_5678.slice"
    );
}

#[test]
fn test_cgroupfs_shapes_by_qos() {
    let guaranteed = container_cgroup_suffix(
        CgroupDriver::Cgroupfs,
        "abc",
        "uid-1",
        ContainerQos::Guaranteed,
    );
    assert_eq!(guaranteed, "/kubepods/poduid-1/abc");

    let besteffort = container_cgroup_suffix(
        CgroupDriver::Cgroupfs,
        "abc",
        "uid-1",
        ContainerQos::BestEffort,
    );
    assert_eq!(besteffort, "/kubepods/besteffort/poduid-1/abc");
}

/// Converting a well-formed pod cgroup path into systemd slice notation and
/// back is the identity.
#[test]
fn test_systemd_round_trip() {
    for path in [
        "/kubepods/burstable/pod1234-abcd-5678",
        "/kubepods/besteffort/pod00-11-22",
        "/kubepods/podffff-0000",
    ] {
        let slice = cgroupfs_to_systemd(path);
        assert_eq!(systemd_to_cgroupfs(&slice), path, "via {slice}");
    }
}

#[test]
fn test_suffix_is_deterministic() {
    let a = container_cgroup_suffix(CgroupDriver::Systemd, "id", "u-1", ContainerQos::Burstable);
    let b = container_cgroup_suffix(CgroupDriver::Systemd, "id", "u-1", ContainerQos::Burstable);
    assert_eq!(a, b);
}
