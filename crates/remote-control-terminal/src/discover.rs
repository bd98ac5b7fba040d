use std::process::Command;

use anyhow::{bail, Context, Result};

/// A process currently attached to a real tty, as reported by `ps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtyCandidate {
    pub pid: u32,
    pub tty: String,
    pub command: String,
    pub args: String,
}

/// Discover processes attached to a tty device. Used by `sessions --all` so
/// the operator can pick a `--tty-path` target.
pub fn list_tty_candidates() -> Result<Vec<TtyCandidate>> {
    let output = Command::new("ps")
        .args(["-eo", "pid=,tty=,comm=,args="])
        .output()
        .context("run ps for tty discovery")?;
    if !output.status.success() {
        bail!(
            "ps failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let mut candidates = parse_ps_output(&String::from_utf8_lossy(&output.stdout));
    candidates.sort_by(|a, b| a.tty.cmp(&b.tty).then(a.pid.cmp(&b.pid)));
    Ok(candidates)
}

fn parse_ps_output(raw: &str) -> Vec<TtyCandidate> {
    raw.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                return None;
            }
            let pid: u32 = fields[0].parse().ok().filter(|&p| p > 0)?;
            let tty = fields[1].trim();
            if tty.is_empty() || tty == "?" || tty == "-" {
                return None;
            }
            Some(TtyCandidate {
                pid,
                tty: tty_path(tty),
                command: fields[2].to_string(),
                args: fields[3..].join(" "),
            })
        })
        .collect()
}

fn tty_path(tty: &str) -> String {
    let tty = tty.trim();
    if tty.is_empty() || tty.starts_with('/') {
        tty.to_string()
    } else {
        format!("/dev/{tty}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_normalizes_tty_names() {
        let raw = "  123 pts/0  zsh   -zsh\n  456 ?      cron  /usr/sbin/cron\n  789 ttys002 bash  bash -l\n";
        let candidates = parse_ps_output(raw);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].pid, 123);
        assert_eq!(candidates[0].tty, "/dev/pts/0");
        assert_eq!(candidates[0].command, "zsh");
        assert_eq!(candidates[0].args, "-zsh");
        assert_eq!(candidates[1].tty, "/dev/ttys002");
    }

    #[test]
    fn skips_detached_and_malformed_rows() {
        let raw = "abc pts/1 sh\n0 pts/2 sh\n42 - sh\n43 pts/3\n";
        assert!(parse_ps_output(raw).is_empty());
    }

    #[test]
    fn keeps_absolute_tty_paths() {
        assert_eq!(tty_path("/dev/pts/9"), "/dev/pts/9");
        assert_eq!(tty_path("pts/9"), "/dev/pts/9");
    }

    #[test]
    fn args_join_preserves_spacing_between_fields() {
        let raw = "10 pts/4 vim vim -u NONE notes.txt\n";
        let candidates = parse_ps_output(raw);
        assert_eq!(candidates[0].command, "vim");
        assert_eq!(candidates[0].args, "vim -u NONE notes.txt");
    }
}
