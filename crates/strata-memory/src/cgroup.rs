#[cfg(target_os = "linux")]
use std::path::PathBuf;
use std::sync::OnceLock;

// Limits at or above 1 EiB are container-runtime spellings of "unlimited".
const UNLIMITED_THRESHOLD_BYTES: u64 = 1 << 60;

/// Effective cgroup memory limit for this process, if one is configured.
///
/// Checks the cgroup v2 unified hierarchy first (`memory.max`), then the
/// v1 memory controller (`memory.limit_in_bytes`). Returns `None` when no
/// limit applies or the platform has no cgroups.
pub(crate) fn memory_limit_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let contents = std::fs::read_to_string("/proc/self/cgroup").ok()?;
        let membership = parse_cgroup_membership(&contents);

        if let Some(path) = membership.v2_path {
            let file = cgroup_file("/sys/fs/cgroup", &path, "memory.max");
            if let Some(limit) = read_limit(&file) {
                return Some(limit);
            }
        }
        if let Some(path) = membership.v1_memory_path {
            let file = cgroup_file("/sys/fs/cgroup/memory", &path, "memory.limit_in_bytes");
            if let Some(limit) = read_limit(&file) {
                return Some(limit);
            }
        }
        None
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(target_os = "linux")]
fn cgroup_file(mount: &str, cgroup_path: &str, file: &str) -> PathBuf {
    let mut path = PathBuf::from(mount);
    path.push(cgroup_path.trim_start_matches('/'));
    path.push(file);
    path
}

#[cfg(target_os = "linux")]
fn read_limit(path: &std::path::Path) -> Option<u64> {
    let raw = std::fs::read_to_string(path).ok()?;
    parse_limit_bytes(&raw)
}

/// Cgroup membership of this process as listed in `/proc/self/cgroup`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CgroupMembership {
    /// cgroup v2 unified hierarchy path (`0::/some/path`).
    pub(crate) v2_path: Option<String>,
    /// cgroup v1 memory controller path (`5:memory:/some/path`).
    pub(crate) v1_memory_path: Option<String>,
}

/// Parse `/proc/self/cgroup` contents. Pure helper for unit testing.
pub(crate) fn parse_cgroup_membership(contents: &str) -> CgroupMembership {
    let mut membership = CgroupMembership::default();
    for line in contents.lines() {
        let mut fields = line.trim().splitn(3, ':');
        let (Some(hierarchy), Some(controllers), Some(path)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let path = path.trim();
        if path.is_empty() {
            continue;
        }

        if membership.v2_path.is_none() && hierarchy == "0" && controllers.is_empty() {
            membership.v2_path = Some(path.to_string());
        }
        if membership.v1_memory_path.is_none()
            && controllers.split(',').any(|c| c.trim() == "memory")
        {
            membership.v1_memory_path = Some(path.to_string());
        }
    }
    membership
}

/// Parse a raw cgroup limit value (`max`, a byte count, or an
/// effectively-unlimited sentinel). Pure helper for unit testing.
pub(crate) fn parse_limit_bytes(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "max" {
        return None;
    }
    let value = match raw.parse::<u64>() {
        Ok(value) => value,
        Err(err) => {
            // Cgroup file formats should be stable, but container runtimes
            // expose surprises; log once and treat as unlimited.
            static REPORTED: OnceLock<()> = OnceLock::new();
            if REPORTED.set(()).is_ok() {
                tracing::debug!(
                    target = "strata.memory",
                    raw,
                    error = %err,
                    "failed to parse cgroup memory limit"
                );
            }
            return None;
        }
    };
    (value < UNLIMITED_THRESHOLD_BYTES).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v2_and_v1_membership() {
        let contents = "12:pids:/user.slice\n5:memory:/machine/app\n0::/user.slice/session\n";
        let membership = parse_cgroup_membership(contents);
        assert_eq!(membership.v2_path.as_deref(), Some("/user.slice/session"));
        assert_eq!(membership.v1_memory_path.as_deref(), Some("/machine/app"));
    }

    #[test]
    fn ignores_malformed_lines() {
        let membership = parse_cgroup_membership("garbage\n\n0::\n");
        assert_eq!(membership, CgroupMembership::default());
    }

    #[test]
    fn limit_parsing_handles_unlimited_spellings() {
        assert_eq!(parse_limit_bytes("max\n"), None);
        assert_eq!(parse_limit_bytes(""), None);
        assert_eq!(parse_limit_bytes("9223372036854771712"), None);
        assert_eq!(parse_limit_bytes("536870912\n"), Some(536870912));
        assert_eq!(parse_limit_bytes("bogus"), None);
    }
}
