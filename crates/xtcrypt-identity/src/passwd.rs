//! Built-in policy over passwd(5) and group(5) formatted databases.

use std::fs;
use std::path::Path;

use tracing::{debug, instrument};
use xtcrypt_core::UserCredentials;

use crate::error::IdentityError;
use crate::policy::IdentityPolicy;

/// One user of the local system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
    pub shell: String,
}

/// One group of the local system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub name: String,
    pub gid: u32,
    /// Supplementary members by user name.
    pub members: Vec<String>,
}

/// Resolves identities from passwd and group databases held in memory.
///
/// Blank lines and lines starting with `#` are ignored. When a name or id
/// appears twice, the first entry wins, as with `getpwnam(3)`.
#[derive(Debug, Clone, Default)]
pub struct PasswdPolicy {
    users: Vec<PasswdEntry>,
    groups: Vec<GroupEntry>,
}

impl PasswdPolicy {
    /// Parse passwd and group database contents.
    pub fn parse(passwd: &str, group: &str) -> Result<Self, IdentityError> {
        let users = records(passwd)
            .map(|(line, text)| parse_passwd_line(line, text))
            .collect::<Result<Vec<_>, _>>()?;
        let groups = records(group)
            .map(|(line, text)| parse_group_line(line, text))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { users, groups })
    }

    /// Read and parse database files.
    #[instrument(
        level = "debug",
        skip_all,
        fields(passwd = %passwd.as_ref().display(), group = %group.as_ref().display())
    )]
    pub fn from_files(
        passwd: impl AsRef<Path>,
        group: impl AsRef<Path>,
    ) -> Result<Self, IdentityError> {
        let passwd = read(passwd.as_ref())?;
        let group = read(group.as_ref())?;
        let policy = Self::parse(&passwd, &group)?;
        debug!(
            users = policy.users.len(),
            groups = policy.groups.len(),
            "Loaded identity databases"
        );
        Ok(policy)
    }

    /// The databases of the running system, `/etc/passwd` and `/etc/group`.
    pub fn system() -> Result<Self, IdentityError> {
        Self::from_files("/etc/passwd", "/etc/group")
    }

    pub fn users(&self) -> &[PasswdEntry] {
        &self.users
    }

    pub fn groups(&self) -> &[GroupEntry] {
        &self.groups
    }

    fn user_by_uid(&self, uid: u32) -> Option<&PasswdEntry> {
        self.users.iter().find(|u| u.uid == uid)
    }

    fn user_by_name(&self, name: &str) -> Option<&PasswdEntry> {
        self.users.iter().find(|u| u.name == name)
    }

    fn group_by_gid(&self, gid: u32) -> Option<&GroupEntry> {
        self.groups.iter().find(|g| g.gid == gid)
    }

    fn group_by_name(&self, name: &str) -> Option<&GroupEntry> {
        self.groups.iter().find(|g| g.name == name)
    }
}

impl IdentityPolicy for PasswdPolicy {
    fn user_credentials(&self, uid: u32, gid: u32) -> Result<UserCredentials, IdentityError> {
        let user = self.user_by_uid(uid).ok_or(IdentityError::UnknownUid(uid))?;
        let primary = self.group_by_gid(gid).ok_or(IdentityError::UnknownGid(gid))?;

        let mut credentials =
            UserCredentials::new(user.name.clone()).with_group(primary.name.clone());
        for group in &self.groups {
            if group.members.iter().any(|m| *m == user.name)
                && !credentials.groups.contains(&group.name)
            {
                credentials.groups.push(group.name.clone());
            }
        }
        Ok(credentials)
    }

    fn passwd(&self, user_id: &str, group_id: &str) -> Result<PasswdEntry, IdentityError> {
        let user = self
            .user_by_name(user_id)
            .ok_or_else(|| IdentityError::UnknownUser(user_id.to_string()))?;
        let group = self
            .group_by_name(group_id)
            .ok_or_else(|| IdentityError::UnknownGroup(group_id.to_string()))?;
        Ok(PasswdEntry {
            gid: group.gid,
            ..user.clone()
        })
    }
}

fn read(path: &Path) -> Result<String, IdentityError> {
    fs::read_to_string(path).map_err(|source| IdentityError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Non-empty, non-comment lines with their 1-based line numbers.
fn records(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim_end_matches('\r')))
        .filter(|(_, line)| !line.trim().is_empty() && !line.starts_with('#'))
}

fn fields<'a>(
    database: &'static str,
    line: usize,
    text: &'a str,
    expected: usize,
) -> Result<Vec<&'a str>, IdentityError> {
    let fields: Vec<&str> = text.split(':').collect();
    if fields.len() != expected {
        return Err(IdentityError::Malformed {
            database,
            line,
            reason: format!("expected {expected} fields, found {}", fields.len()),
        });
    }
    if fields[0].is_empty() {
        return Err(IdentityError::Malformed {
            database,
            line,
            reason: "empty name".into(),
        });
    }
    Ok(fields)
}

fn parse_id(
    database: &'static str,
    line: usize,
    what: &str,
    value: &str,
) -> Result<u32, IdentityError> {
    value.parse().map_err(|_| IdentityError::Malformed {
        database,
        line,
        reason: format!("invalid {what} '{value}'"),
    })
}

fn parse_passwd_line(line: usize, text: &str) -> Result<PasswdEntry, IdentityError> {
    // name:password:uid:gid:gecos:home:shell
    let f = fields("passwd", line, text, 7)?;
    Ok(PasswdEntry {
        name: f[0].to_string(),
        uid: parse_id("passwd", line, "uid", f[2])?,
        gid: parse_id("passwd", line, "gid", f[3])?,
        home: f[5].to_string(),
        shell: f[6].to_string(),
    })
}

fn parse_group_line(line: usize, text: &str) -> Result<GroupEntry, IdentityError> {
    // name:password:gid:member,member
    let f = fields("group", line, text, 4)?;
    Ok(GroupEntry {
        name: f[0].to_string(),
        gid: parse_id("group", line, "gid", f[2])?,
        members: f[3]
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect(),
    })
}
