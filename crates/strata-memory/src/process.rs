use std::sync::OnceLock;

/// Current resident set size of this process, if the platform exposes it
/// through `/proc/self/status`.
pub(crate) fn rss_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let status = match std::fs::read_to_string("/proc/self/status") {
            Ok(status) => status,
            Err(err) => {
                // `/proc` may be missing in sandboxed environments; only log
                // errors that are not plain absence.
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(
                        target = "strata.memory",
                        error = %err,
                        "failed to read /proc/self/status while sampling rss"
                    );
                }
                return None;
            }
        };
        parse_vm_rss_bytes(&status)
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Extract the `VmRSS` value from `/proc/self/status` contents.
///
/// Pure helper so the line format can be unit tested without a live `/proc`.
pub(crate) fn parse_vm_rss_bytes(status: &str) -> Option<u64> {
    let rest = status
        .lines()
        .map(str::trim_start)
        .find_map(|line| line.strip_prefix("VmRSS:"))?;
    let kb = rest.split_whitespace().next()?;
    match kb.parse::<u64>() {
        Ok(kb) => Some(kb.saturating_mul(1024)),
        Err(err) => {
            // `VmRSS` is expected to be numeric kB; log once rather than on
            // every sample of a hot path.
            static REPORTED: OnceLock<()> = OnceLock::new();
            if REPORTED.set(()).is_ok() {
                tracing::debug!(
                    target = "strata.memory",
                    value = kb,
                    error = %err,
                    "failed to parse VmRSS from /proc/self/status"
                );
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vm_rss_line() {
        let status = "Name:\tstrata\nVmPeak:\t  204800 kB\nVmRSS:\t  102400 kB\n";
        assert_eq!(parse_vm_rss_bytes(status), Some(102400 * 1024));
    }

    #[test]
    fn missing_or_malformed_rss_yields_none() {
        assert_eq!(parse_vm_rss_bytes("Name:\tstrata\n"), None);
        assert_eq!(parse_vm_rss_bytes("VmRSS:\tnot-a-number kB\n"), None);
    }
}
