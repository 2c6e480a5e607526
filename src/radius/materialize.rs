//! Render a [`RadiusConfig`] into a FreeRADIUS configuration directory.

use super::{
    assets::{AssetProvider, EmbeddedAssets, TemplateContext},
    system::{self, Identity, SystemDefaults},
    Error,
};
use crate::config::RadiusConfig;
use nix::unistd::{chown, Gid, Uid};
use secrecy::ExposeSecret;
use std::{
    fs::{self, DirBuilder, OpenOptions, Permissions},
    io::{self, Write},
    os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

const ROOT_MODE: u32 = 0o750;
const DIR_MODE: u32 = 0o755;
const STATIC_FILE_MODE: u32 = 0o644;
const RENDERED_FILE_MODE: u32 = 0o664;
const PRIVATE_FILE_MODE: u32 = 0o660;

const DH_PRIME_BITS: u32 = 1024;
const DH_GENERATOR: u32 = 2;

pub const API_AUTHORIZE_PATH: &str = "/api/v1/authorize";
pub const API_DYNAMIC_PATH: &str = "/api/v1/dynamic-client";

/// A template and where it lands in the tree.
#[derive(Debug, Clone, Copy)]
pub struct TemplateTarget {
    pub template: &'static str,
    pub target: &'static str,
    pub admin_only: bool,
}

/// Rendered in this order.
pub const TEMPLATE_TARGETS: &[TemplateTarget] = &[
    TemplateTarget {
        template: "radiusd.conf.tmpl",
        target: "radiusd.conf",
        admin_only: false,
    },
    TemplateTarget {
        template: "default.tmpl",
        target: "sites-enabled/default",
        admin_only: true,
    },
    TemplateTarget {
        template: "inner-tunnel.tmpl",
        target: "sites-enabled/inner-tunnel",
        admin_only: false,
    },
    TemplateTarget {
        template: "apn.tmpl",
        target: "sites-enabled/apn",
        admin_only: false,
    },
    TemplateTarget {
        template: "eap.tmpl",
        target: "mods-enabled/eap",
        admin_only: false,
    },
    TemplateTarget {
        template: "rest.tmpl",
        target: "mods-enabled/rest",
        admin_only: false,
    },
    TemplateTarget {
        template: "dynamic-clients.tmpl",
        target: "sites-enabled/dynamic-clients",
        admin_only: true,
    },
    TemplateTarget {
        template: "rip.tmpl",
        target: "sites-enabled/rip",
        admin_only: true,
    },
    TemplateTarget {
        template: "dynamic-clients.mods.tmpl",
        target: "mods-enabled/dynamic-clients",
        admin_only: true,
    },
];

/// Paths of a rendered configuration tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedTree {
    root: PathBuf,
}

impl RenderedTree {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn tls_dir(&self) -> PathBuf {
        self.root.join("tls")
    }

    #[must_use]
    pub fn private_key(&self) -> PathBuf {
        self.tls_dir().join("private.pem")
    }

    #[must_use]
    pub fn bundle(&self) -> PathBuf {
        self.tls_dir().join("bundle.pem")
    }

    #[must_use]
    pub fn ca(&self) -> PathBuf {
        self.tls_dir().join("ca.pem")
    }

    #[must_use]
    pub fn dh_param(&self) -> PathBuf {
        self.tls_dir().join("dhparam.pem")
    }

    /// Remove the whole tree. A missing tree is not an error.
    ///
    /// # Errors
    /// Returns an error if the directory exists but cannot be removed.
    pub fn remove(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.root) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// Writes configuration trees from an [`AssetProvider`].
#[derive(Debug, Clone)]
pub struct Materializer {
    assets: Arc<dyn AssetProvider>,
    defaults: SystemDefaults,
}

impl Default for Materializer {
    fn default() -> Self {
        Self::new(Arc::new(EmbeddedAssets), SystemDefaults::default())
    }
}

impl Materializer {
    #[must_use]
    pub fn new(assets: Arc<dyn AssetProvider>, defaults: SystemDefaults) -> Self {
        Self { assets, defaults }
    }

    /// Build `<run_directory>/radius` for `config`.
    ///
    /// Existing files are overwritten, `dhparam.pem` is kept when present. With
    /// `clean_on_stop` a failed build leaves nothing behind.
    ///
    /// # Errors
    /// Returns the first filesystem, rendering or ownership failure.
    #[instrument(skip(self, config), fields(root = %config.configuration_base().display()))]
    pub fn materialize(&self, config: &RadiusConfig) -> Result<RenderedTree, Error> {
        let tree = RenderedTree::new(config.configuration_base());

        match self.build(config, &tree) {
            Ok(()) => {
                debug!("configuration materialized");
                Ok(tree)
            }
            Err(e) => {
                if config.clean_on_stop {
                    if let Err(rm) = tree.remove() {
                        warn!("Failed to remove partial configuration: {}", rm);
                    }
                }
                Err(e)
            }
        }
    }

    fn build(&self, config: &RadiusConfig, tree: &RenderedTree) -> Result<(), Error> {
        create_dir(tree.root(), ROOT_MODE)?;

        for file in self.assets.list_files() {
            let content = self.assets.read_file(file).map_err(|e| Error::Render {
                name: file.to_string(),
                reason: e.to_string(),
            })?;
            let target = tree.root().join(file);
            create_parent(tree, &target)?;
            write_file(&target, &content, STATIC_FILE_MODE)?;
        }

        let identity = Identity::resolve(&self.defaults, config.stay_root);

        let ca_path = write_tls(config, tree)?;

        let context = self.context(config, tree, &ca_path, &identity);

        for target in TEMPLATE_TARGETS {
            let path = tree.root().join(target.target);

            if target.admin_only && !config.enable_admin {
                remove_stale(&path)?;
                continue;
            }

            let rendered = self
                .assets
                .render_template(target.template, &context)
                .map_err(|e| Error::Render {
                    name: target.template.to_string(),
                    reason: e.to_string(),
                })?;

            create_parent(tree, &path)?;
            write_file(&path, rendered.as_bytes(), RENDERED_FILE_MODE)?;
        }

        if identity.changes_user() {
            chown_tree(tree.root(), &identity)?;
        }

        Ok(())
    }

    fn context(
        &self,
        config: &RadiusConfig,
        tree: &RenderedTree,
        ca_path: &Path,
        identity: &Identity,
    ) -> TemplateContext {
        let listen_address = match config.interface_ip {
            Some(ip) if config.enable_admin => ip.to_string(),
            _ => "127.0.0.1".to_string(),
        };

        let client_net = config
            .client_net
            .clone()
            .unwrap_or_else(|| config.interface_net.clone());

        let security_identity = if identity.changes_user() {
            format!("\tuser = {}\n\tgroup = {}\n", identity.user, identity.group)
        } else {
            String::new()
        };

        let mut context = TemplateContext::new();
        context
            .insert(
                "prefix",
                self.defaults.value_or("prefix", system::PREFIX_DIRECTORY),
            )
            .insert(
                "lib_dir",
                self.defaults.value_or("libdir", system::LIB_DIRECTORY),
            )
            .insert("conf_dir", tree.root().display().to_string())
            .insert("max_request_time", config.max_request_time.to_string())
            .insert("cleanup_delay", config.cleanup_delay.to_string())
            .insert("max_requests", config.max_requests.to_string())
            .insert("log_auth", yes_no(config.log_auth))
            .insert("security_identity", security_identity)
            .insert("client_net", client_net)
            .insert("radius_secret", config.secret.expose_secret())
            .insert("start_servers", config.start_servers.to_string())
            .insert("max_servers", config.max_servers.to_string())
            .insert("min_spare_servers", config.min_spare_servers.to_string())
            .insert("max_spare_servers", config.max_spare_servers.to_string())
            .insert("max_queue_size", config.max_queue_size.to_string())
            .insert("listen_address", listen_address)
            .insert("listen_port", config.port.to_string())
            .insert("private_key", tree.private_key().display().to_string())
            .insert("certificate_bundle", tree.bundle().display().to_string())
            .insert("certificate_authority", ca_path.display().to_string())
            .insert("dh_param", tree.dh_param().display().to_string())
            .insert("auto_chain", yes_no(config.enable_auto_chain))
            .insert(
                "api_server",
                format!("http://{}:{}", config.api_host, config.api_port),
            )
            .insert("api_authorize_path", API_AUTHORIZE_PATH)
            .insert("api_dynamic_path", API_DYNAMIC_PATH)
            .insert("api_token", config.api_token.expose_secret());

        context
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

/// Write the TLS material and return the path templates use as CA file.
fn write_tls(config: &RadiusConfig, tree: &RenderedTree) -> Result<PathBuf, Error> {
    create_dir(&tree.tls_dir(), DIR_MODE)?;

    write_file(
        &tree.private_key(),
        config.key.expose_secret().as_bytes(),
        PRIVATE_FILE_MODE,
    )?;

    let bundle = if config.no_bundle || config.ca.is_empty() {
        config.certificate.clone()
    } else {
        format!("{}\n{}", config.certificate, config.ca)
    };
    write_file(&tree.bundle(), bundle.as_bytes(), RENDERED_FILE_MODE)?;

    let ca_path = if config.ca.is_empty() {
        remove_stale(&tree.ca())?;
        tree.bundle()
    } else {
        write_file(&tree.ca(), config.ca.as_bytes(), RENDERED_FILE_MODE)?;
        tree.ca()
    };

    let dh_param = tree.dh_param();
    if !dh_param.exists() {
        match generate_dh_params() {
            Ok(pem) => {
                if let Err(e) = write_file(&dh_param, &pem, PRIVATE_FILE_MODE) {
                    warn!("Failed to write DH parameters: {}", e);
                }
            }
            Err(e) => warn!("Failed to generate DH parameters: {}", e),
        }
    }

    Ok(ca_path)
}

fn generate_dh_params() -> Result<Vec<u8>, openssl::error::ErrorStack> {
    debug!(bits = DH_PRIME_BITS, "generating DH parameters");
    openssl::dh::Dh::generate_params(DH_PRIME_BITS, DH_GENERATOR)?.params_to_pem()
}

fn create_dir(path: &Path, mode: u32) -> Result<(), Error> {
    let materialize = |source| Error::Materialize {
        path: path.to_path_buf(),
        source,
    };

    DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
        .map_err(materialize)?;

    fs::set_permissions(path, Permissions::from_mode(mode)).map_err(materialize)
}

/// Subdirectories of the tree are 0755, the root keeps its own mode.
fn create_parent(tree: &RenderedTree, path: &Path) -> Result<(), Error> {
    match path.parent() {
        Some(parent) if parent != tree.root() => create_dir(parent, DIR_MODE),
        _ => Ok(()),
    }
}

fn write_file(path: &Path, content: &[u8], mode: u32) -> Result<(), Error> {
    let materialize = |source| Error::Materialize {
        path: path.to_path_buf(),
        source,
    };

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .map_err(materialize)?;

    file.write_all(content).map_err(materialize)?;

    // mode() only applies to newly created files and is subject to the umask
    fs::set_permissions(path, Permissions::from_mode(mode)).map_err(materialize)
}

/// Drop a file left by a previous build that the current one does not produce.
fn remove_stale(path: &Path) -> Result<(), Error> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(Error::Materialize {
            path: path.to_path_buf(),
            source: e,
        }),
        _ => Ok(()),
    }
}

fn chown_tree(root: &Path, identity: &Identity) -> Result<(), Error> {
    let uid = Some(Uid::from_raw(identity.uid));
    let gid = Some(Gid::from_raw(identity.gid));

    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| Error::Materialize {
            path: root.to_path_buf(),
            source: e.into(),
        })?;

        chown(entry.path(), uid, gid).map_err(|source| Error::Ownership {
            path: entry.path().to_path_buf(),
            source,
        })?;
    }

    Ok(())
}
