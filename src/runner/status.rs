// src/runner/status.rs

//! Parsers for the machine-readable status lines apt and dpkg write to the
//! status file descriptor

use regex::Regex;
use std::sync::LazyLock;

static CONFFILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'(.*?)'\s+'(.*?)'").expect("valid regex"));

/// Which protocol the child speaks on the status descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusProtocol {
    /// `APT::Status-Fd` lines: `pmstatus:`, `dlstatus:`, ...
    Apt,
    /// `dpkg --status-fd` lines: `status:`, `processing:`
    Dpkg,
}

impl StatusProtocol {
    pub fn parse(&self, line: &str) -> Option<StatusEvent> {
        match self {
            StatusProtocol::Apt => parse_apt_status(line),
            StatusProtocol::Dpkg => parse_dpkg_status(line),
        }
    }
}

/// One parsed status line
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    /// Download progress: `dlstatus:<item>:<percent>:<message>`
    Download {
        item: String,
        percent: f64,
        message: String,
    },
    /// Package manager progress: `pmstatus:<pkg>:<percent>:<message>`
    Package {
        package: String,
        percent: f64,
        message: String,
    },
    /// Package manager error: `pmerror:<pkg>:<percent>:<message>`
    PackageError { package: String, message: String },
    /// A modified configuration file needs an answer
    ConfigFileConflict { old: String, new: String },
    /// A removable medium must be inserted
    MediaChange { label: String, drive: String },
    /// dpkg: `status: <pkg>: <state>`
    DpkgState { package: String, state: String },
    /// dpkg: `processing: <action>: <pkg>`
    DpkgProcessing { action: String, package: String },
    /// dpkg: `status: <pkg> : error : <message>`
    DpkgError { package: String, message: String },
}

fn parse_conffile_args(text: &str) -> Option<(String, String)> {
    let caps = CONFFILE_RE.captures(text)?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

/// Parse one `APT::Status-Fd` line
pub fn parse_apt_status(line: &str) -> Option<StatusEvent> {
    let line = line.trim_end();
    if let Some(rest) = line.strip_prefix("media-change:") {
        let mut parts = rest.trim_start().splitn(3, ':');
        let label = parts.next()?.trim().to_string();
        let drive = parts.next()?.trim().to_string();
        return Some(StatusEvent::MediaChange { label, drive });
    }

    let mut parts = line.splitn(4, ':');
    let tag = parts.next()?;
    let subject = parts.next()?.trim().to_string();
    let percent_text = parts.next()?;
    let message = parts.next().unwrap_or("").trim().to_string();

    match tag {
        "pmconffile" => {
            let (old, new) = parse_conffile_args(&message)?;
            Some(StatusEvent::ConfigFileConflict { old, new })
        }
        "pmstatus" | "dlstatus" | "pmerror" => {
            let percent = percent_text.trim().parse::<f64>().ok()?;
            Some(match tag {
                "pmstatus" => StatusEvent::Package {
                    package: subject,
                    percent,
                    message,
                },
                "dlstatus" => StatusEvent::Download {
                    item: subject,
                    percent,
                    message,
                },
                _ => StatusEvent::PackageError {
                    package: subject,
                    message,
                },
            })
        }
        _ => None,
    }
}

/// Parse one `dpkg --status-fd` line
///
/// Package names may carry an architecture qualifier (`libc6:amd64`), so
/// fields are split on `": "` and `" : "` rather than on every colon.
pub fn parse_dpkg_status(line: &str) -> Option<StatusEvent> {
    let line = line.trim_end();
    if let Some(rest) = line.strip_prefix("processing:") {
        let (action, package) = rest.trim_start().split_once(": ")?;
        return Some(StatusEvent::DpkgProcessing {
            action: action.trim().to_string(),
            package: package.trim().to_string(),
        });
    }

    let rest = line.strip_prefix("status:")?.trim_start();
    if rest.contains(" : ") {
        let mut parts = rest.splitn(3, " : ");
        let subject = parts.next()?.trim().to_string();
        let kind = parts.next()?.trim();
        let tail = parts.next().unwrap_or("").trim();
        return match kind {
            "error" => Some(StatusEvent::DpkgError {
                package: subject,
                message: tail.to_string(),
            }),
            "conffile-prompt" => {
                let (old, new) = parse_conffile_args(tail)?;
                Some(StatusEvent::ConfigFileConflict { old, new })
            }
            _ => None,
        };
    }

    let (package, state) = rest.rsplit_once(": ")?;
    Some(StatusEvent::DpkgState {
        package: package.trim().to_string(),
        state: state.trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pmstatus() {
        assert_eq!(
            parse_apt_status("pmstatus:libfoo:42.8571:Preparing libfoo (amd64)"),
            Some(StatusEvent::Package {
                package: "libfoo".into(),
                percent: 42.8571,
                message: "Preparing libfoo (amd64)".into(),
            })
        );
    }

    #[test]
    fn test_pmstatus_message_with_colons() {
        match parse_apt_status("pmstatus:dpkg-exec:0.0000:Running dpkg: step 1").unwrap() {
            StatusEvent::Package { message, .. } => assert_eq!(message, "Running dpkg: step 1"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_dlstatus_and_pmerror() {
        assert!(matches!(
            parse_apt_status("dlstatus:1:9.5:Retrieving file 1 of 3"),
            Some(StatusEvent::Download { ref item, percent, .. }) if item == "1" && percent == 9.5
        ));
        assert_eq!(
            parse_apt_status("pmerror:/var/cache/apt/archives/foo.deb:50:trying to overwrite"),
            Some(StatusEvent::PackageError {
                package: "/var/cache/apt/archives/foo.deb".into(),
                message: "trying to overwrite".into(),
            })
        );
    }

    #[test]
    fn test_pmconffile() {
        assert_eq!(
            parse_apt_status(
                "pmconffile:/etc/foo.conf:40.0000: '/etc/foo.conf' '/etc/foo.conf.dpkg-new' 1 1"
            ),
            Some(StatusEvent::ConfigFileConflict {
                old: "/etc/foo.conf".into(),
                new: "/etc/foo.conf.dpkg-new".into(),
            })
        );
    }

    #[test]
    fn test_media_change() {
        assert_eq!(
            parse_apt_status(
                "media-change: Debian GNU/Linux 12 DVD-1:/media/cdrom/:Please insert the disc"
            ),
            Some(StatusEvent::MediaChange {
                label: "Debian GNU/Linux 12 DVD-1".into(),
                drive: "/media/cdrom/".into(),
            })
        );
    }

    #[test]
    fn test_apt_garbage() {
        assert_eq!(parse_apt_status(""), None);
        assert_eq!(parse_apt_status("hello world"), None);
        assert_eq!(parse_apt_status("pmstatus:foo:notanumber:x"), None);
    }

    #[test]
    fn test_dpkg_state_with_arch_qualifier() {
        assert_eq!(
            parse_dpkg_status("status: libc6:amd64: half-configured"),
            Some(StatusEvent::DpkgState {
                package: "libc6:amd64".into(),
                state: "half-configured".into(),
            })
        );
    }

    #[test]
    fn test_dpkg_processing() {
        assert_eq!(
            parse_dpkg_status("processing: unpack: foo"),
            Some(StatusEvent::DpkgProcessing {
                action: "unpack".into(),
                package: "foo".into(),
            })
        );
    }

    #[test]
    fn test_dpkg_error_and_conffile() {
        assert_eq!(
            parse_dpkg_status("status: foo : error : subprocess returned error exit status 1"),
            Some(StatusEvent::DpkgError {
                package: "foo".into(),
                message: "subprocess returned error exit status 1".into(),
            })
        );
        assert_eq!(
            parse_dpkg_status(
                "status: /etc/foo.conf : conffile-prompt : '/etc/foo.conf' '/etc/foo.conf.dpkg-new' 1 1 "
            ),
            Some(StatusEvent::ConfigFileConflict {
                old: "/etc/foo.conf".into(),
                new: "/etc/foo.conf.dpkg-new".into(),
            })
        );
    }

    #[test]
    fn test_protocol_dispatch() {
        assert!(StatusProtocol::Dpkg.parse("pmstatus:foo:1:x").is_none());
        assert!(StatusProtocol::Apt.parse("pmstatus:foo:1:x").is_some());
    }
}
