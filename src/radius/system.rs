//! Host FreeRADIUS installation defaults.
//!
//! The packaged `radiusd.conf` tells us where FreeRADIUS lives (`prefix`, `libdir`)
//! and which account it expects to drop privileges to (`user`, `group`).

use anyhow::{anyhow, Context, Result};
use nix::unistd::{Group, User};
use regex::Regex;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::trace;

pub const BINARY_NAME: &str = "radiusd";
pub const RUN_DIRECTORY: &str = "/var/run";

#[cfg(target_os = "freebsd")]
pub const ETC_DIRECTORY: &str = "/usr/local/etc/raddb";
#[cfg(not(target_os = "freebsd"))]
pub const ETC_DIRECTORY: &str = "/etc/freeradius/3.0";

#[cfg(target_os = "freebsd")]
pub const PREFIX_DIRECTORY: &str = "/usr/local";
#[cfg(not(target_os = "freebsd"))]
pub const PREFIX_DIRECTORY: &str = "/usr";

#[cfg(target_os = "freebsd")]
pub const LIB_DIRECTORY: &str = "/usr/local/lib/freeradius-3.0";
#[cfg(not(target_os = "freebsd"))]
pub const LIB_DIRECTORY: &str = "/usr/lib/freeradius";

pub const DEFAULT_USER: &str = "freeradius";
pub const DEFAULT_GROUP: &str = "freeradius";

/// Where the system `radiusd.conf` files are searched, in order.
#[derive(Debug, Clone)]
pub struct SystemDefaults {
    search: Vec<PathBuf>,
}

impl Default for SystemDefaults {
    fn default() -> Self {
        Self::new(vec![
            PathBuf::from(ETC_DIRECTORY),
            PathBuf::from("/etc/raddb"),
        ])
    }
}

impl SystemDefaults {
    #[must_use]
    pub fn new(search: Vec<PathBuf>) -> Self {
        Self { search }
    }

    /// Read `name = value` from the first `radiusd.conf` found.
    ///
    /// # Errors
    /// Returns an error if no configuration file exists or `name` is not set in it.
    pub fn value(&self, name: &str) -> Result<String> {
        let Some(conf) = self
            .search
            .iter()
            .map(|base| base.join("radiusd.conf"))
            .find(|conf| conf.is_file())
        else {
            return Err(anyhow!("no valid configuration file found"));
        };

        lookup(&conf, name)
    }

    /// Like [`SystemDefaults::value`] but falls back to `default`.
    #[must_use]
    pub fn value_or(&self, name: &str, default: &str) -> String {
        self.value(name).unwrap_or_else(|e| {
            trace!("cannot get value for {name}, using default {default}: {e}");
            default.to_string()
        })
    }
}

fn lookup(conf: &Path, name: &str) -> Result<String> {
    let re = Regex::new(&format!(
        r#"(?m)^[ \t]*{}[ \t]*=[ \t]*"?([^"\n]+)"?"#,
        regex::escape(name)
    ))?;

    let content =
        fs::read_to_string(conf).with_context(|| format!("cannot read {}", conf.display()))?;

    re.captures(&content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .ok_or_else(|| anyhow!("{name} not in {}", conf.display()))
}

/// Identity the RADIUS process will drop to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub group: String,
    pub uid: u32,
    pub gid: u32,
}

impl Identity {
    #[must_use]
    pub fn root() -> Self {
        Self {
            user: "root".to_string(),
            group: "root".to_string(),
            uid: 0,
            gid: 0,
        }
    }

    /// Whether privileges are actually dropped.
    #[must_use]
    pub fn changes_user(&self) -> bool {
        self.uid != 0
    }

    /// Resolve the FreeRADIUS user and group.
    ///
    /// Lookup failures are not fatal: the id stays 0 and radiusd keeps running as the
    /// invoking user.
    #[must_use]
    pub fn resolve(defaults: &SystemDefaults, stay_root: bool) -> Self {
        if stay_root {
            return Self::root();
        }

        let user = defaults.value_or("user", DEFAULT_USER);
        let group = defaults.value_or("group", DEFAULT_GROUP);

        let uid = match User::from_name(&user) {
            Ok(Some(u)) => u.uid.as_raw(),
            Ok(None) => {
                trace!("cannot get uid of {user}: no such user");
                0
            }
            Err(e) => {
                trace!("cannot get uid of {user}: {e}");
                0
            }
        };

        let gid = match Group::from_name(&group) {
            Ok(Some(g)) => g.gid.as_raw(),
            Ok(None) => {
                trace!("cannot get gid of {group}: no such group");
                0
            }
            Err(e) => {
                trace!("cannot get gid of {group}: {e}");
                0
            }
        };

        Self {
            user,
            group,
            uid,
            gid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn conf_dir(content: &str) -> Result<PathBuf> {
        let dir = std::env::temp_dir().join(format!("radrotor-system-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("radiusd.conf"), content)?;
        Ok(dir)
    }

    #[test]
    fn value_reads_quoted_and_bare() -> Result<()> {
        let dir = conf_dir(
            "prefix = /opt/radius\n\tlibdir = \"/opt/radius/lib\"\n# user = nobody\n  user = radiusd\n",
        )?;
        let defaults = SystemDefaults::new(vec![dir.clone()]);

        assert_eq!(defaults.value("prefix")?, "/opt/radius");
        assert_eq!(defaults.value("libdir")?, "/opt/radius/lib");
        assert_eq!(defaults.value("user")?, "radiusd");
        assert!(defaults.value("group").is_err());
        assert_eq!(defaults.value_or("group", "wheel"), "wheel");

        fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn first_existing_file_wins() -> Result<()> {
        let first = conf_dir("user = first\n")?;
        let second = conf_dir("user = second\n")?;
        let missing = std::env::temp_dir().join(format!("radrotor-missing-{}", Uuid::new_v4()));

        let defaults = SystemDefaults::new(vec![missing, first.clone(), second.clone()]);
        assert_eq!(defaults.value("user")?, "first");

        fs::remove_dir_all(first)?;
        fs::remove_dir_all(second)?;
        Ok(())
    }

    #[test]
    fn no_configuration_file() {
        let defaults = SystemDefaults::new(vec![]);
        assert!(defaults.value("prefix").is_err());
        assert_eq!(defaults.value_or("prefix", PREFIX_DIRECTORY), PREFIX_DIRECTORY);
    }

    #[test]
    fn stay_root_skips_lookup() {
        let identity = Identity::resolve(&SystemDefaults::new(vec![]), true);
        assert_eq!(identity, Identity::root());
        assert!(!identity.changes_user());
    }

    #[test]
    fn unknown_user_falls_back_to_root_ids() -> Result<()> {
        let dir = conf_dir("user = radrotor-no-such-user\ngroup = radrotor-no-such-group\n")?;
        let identity = Identity::resolve(&SystemDefaults::new(vec![dir.clone()]), false);

        assert_eq!(identity.user, "radrotor-no-such-user");
        assert_eq!(identity.uid, 0);
        assert_eq!(identity.gid, 0);
        assert!(!identity.changes_user());

        fs::remove_dir_all(dir)?;
        Ok(())
    }
}
