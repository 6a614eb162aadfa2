//! Hosts-file override for cluster service names
//!
//! Host-dump mode writes cluster service addresses into the local hosts
//! file so service names resolve on the workstation. kubetun owns a
//! marker-delimited block inside that file: dumping replaces the block,
//! reverting removes it, and everything outside the block is left alone.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const BLOCK_BEGIN: &str = "# kubetun hosts begin";
const BLOCK_END: &str = "# kubetun hosts end";

#[cfg(windows)]
const SYSTEM_HOSTS: &str = r"C:\Windows\System32\drivers\etc\hosts";
#[cfg(not(windows))]
const SYSTEM_HOSTS: &str = "/etc/hosts";

/// Merge per-namespace service tables into one resolution table.
///
/// Entries from the primary namespace keep their bare service name; every
/// other namespace contributes qualified `service.namespace` keys, so the
/// two can never collide. The primary namespace is skipped when it also
/// appears in `extras`. Entries with an empty address or the literal
/// placeholder "None" are dropped.
pub fn merge_host_tables(
    primary_namespace: &str,
    primary: HashMap<String, String>,
    extras: Vec<(String, HashMap<String, String>)>,
) -> HashMap<String, String> {
    let mut table = HashMap::new();
    for (service, address) in primary {
        if resolvable(&address) {
            table.insert(service, address);
        }
    }
    for (namespace, hosts) in extras {
        if namespace == primary_namespace {
            continue;
        }
        for (service, address) in hosts {
            if resolvable(&address) {
                table.insert(format!("{service}.{namespace}"), address);
            }
        }
    }
    table
}

fn resolvable(address: &str) -> bool {
    !address.is_empty() && address != "None"
}

/// Handle on a hosts file holding the kubetun override block.
#[derive(Debug, Clone)]
pub struct HostsFile {
    path: PathBuf,
}

impl HostsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The platform's system hosts file.
    pub fn system() -> Self {
        Self::new(SYSTEM_HOSTS)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `table` as the kubetun block, replacing any previous block.
    pub fn dump(&self, table: &HashMap<String, String>) -> io::Result<()> {
        let mut lines = self.lines_without_block()?;
        let mut entries: Vec<_> = table.iter().collect();
        entries.sort();

        lines.push(BLOCK_BEGIN.to_string());
        for (name, address) in entries {
            lines.push(format!("{address}\t{name}"));
        }
        lines.push(BLOCK_END.to_string());

        fs::write(&self.path, lines.join("\n") + "\n")
    }

    /// Remove the kubetun block, leaving the rest of the file untouched.
    pub fn revert(&self) -> io::Result<()> {
        let lines = self.lines_without_block()?;
        fs::write(&self.path, lines.join("\n") + "\n")
    }

    fn lines_without_block(&self) -> io::Result<Vec<String>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err),
        };

        let mut inside_block = false;
        let mut lines = Vec::new();
        for line in content.lines() {
            if line.trim() == BLOCK_BEGIN {
                inside_block = true;
                continue;
            }
            if line.trim() == BLOCK_END {
                inside_block = false;
                continue;
            }
            if !inside_block {
                lines.push(line.to_string());
            }
        }
        // Drop trailing blanks left behind by previous reverts
        while lines.last().is_some_and(|line| line.is_empty()) {
            lines.pop();
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn table(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(name, address)| (name.to_string(), address.to_string()))
            .collect()
    }

    #[test]
    fn test_merge_qualifies_extra_namespaces() {
        let merged = merge_host_tables(
            "ns1",
            table(&[("svcA", "1.1.1.1")]),
            vec![("ns2".to_string(), table(&[("svcA", "2.2.2.2"), ("svcB", "")]))],
        );

        assert_eq!(
            merged,
            table(&[("svcA", "1.1.1.1"), ("svcA.ns2", "2.2.2.2")])
        );
    }

    #[test]
    fn test_merge_skips_primary_namespace_in_extras() {
        let merged = merge_host_tables(
            "ns1",
            table(&[("svcA", "1.1.1.1")]),
            vec![("ns1".to_string(), table(&[("svcA", "9.9.9.9")]))],
        );

        assert_eq!(merged, table(&[("svcA", "1.1.1.1")]));
    }

    #[test]
    fn test_merge_drops_unresolvable_addresses() {
        let merged = merge_host_tables(
            "ns1",
            table(&[("headless", "None"), ("empty", ""), ("svcA", "1.1.1.1")]),
            vec![("ns2".to_string(), table(&[("other", "None")]))],
        );

        assert_eq!(merged, table(&[("svcA", "1.1.1.1")]));
    }

    #[test]
    fn test_dump_preserves_unrelated_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        fs::write(&path, "127.0.0.1\tlocalhost\n").unwrap();

        let hosts = HostsFile::new(&path);
        hosts.dump(&table(&[("svcA", "1.1.1.1")])).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("127.0.0.1\tlocalhost\n"));
        assert!(content.contains("1.1.1.1\tsvcA"));
        assert!(content.contains(BLOCK_BEGIN));
        assert!(content.contains(BLOCK_END));
    }

    #[test]
    fn test_dump_twice_replaces_block() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts");

        let hosts = HostsFile::new(&path);
        hosts.dump(&table(&[("svcA", "1.1.1.1")])).unwrap();
        hosts.dump(&table(&[("svcB", "2.2.2.2")])).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(!content.contains("svcA"));
        assert!(content.contains("2.2.2.2\tsvcB"));
        assert_eq!(content.matches(BLOCK_BEGIN).count(), 1);
    }

    #[test]
    fn test_revert_removes_only_the_block() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        fs::write(&path, "127.0.0.1\tlocalhost\n").unwrap();

        let hosts = HostsFile::new(&path);
        hosts.dump(&table(&[("svcA", "1.1.1.1")])).unwrap();
        hosts.revert().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "127.0.0.1\tlocalhost\n");
    }

    #[test]
    fn test_dump_creates_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts");

        let hosts = HostsFile::new(&path);
        hosts.dump(&table(&[("svcA", "1.1.1.1")])).unwrap();

        assert!(path.exists());
    }
}
