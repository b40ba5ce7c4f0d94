/*!
  This crate contains constants shared across the agent's crates: well-known
  filesystem paths, database key names, and the device API endpoints.
*/

// Shared default paths
pub const DEFAULT_CONF_FILE: &str = "/etc/mender/mender.conf";
pub const DEFAULT_FALLBACK_CONF_FILE: &str = "/var/lib/mender/mender.conf";
pub const DEFAULT_DATA_STORE_DIR: &str = "/var/lib/mender";
pub const DEFAULT_DEVICE_TYPE_FILE: &str = "/var/lib/mender/device_type";
pub const DEFAULT_MODULES_PATH: &str = "/usr/share/mender/modules/v3";
pub const DEFAULT_MODULES_WORK_PATH: &str = "/var/lib/mender/modules/v3";
pub const DEFAULT_ROOTFS_SCRIPTS_PATH: &str = "/etc/mender/scripts";
pub const DEFAULT_ARTIFACT_SCRIPTS_PATH: &str = "/var/lib/mender/scripts";
pub const DEFAULT_INVENTORY_GENERATORS_DIR: &str = "/usr/share/mender/inventory";
pub const DEFAULT_AUTH_SOCKET: &str = "/run/mender-auth/api.sock";

// Name of the key-value database file under the data store dir.
pub const STORE_FILE_NAME: &str = "mender-store";

// Database keys. The names are part of the on-disk format and must not
// change between releases.
pub const ARTIFACT_NAME_KEY: &str = "artifact-name";
pub const ARTIFACT_GROUP_KEY: &str = "artifact-group";
pub const ARTIFACT_PROVIDES_KEY: &str = "artifact-provides";
pub const STATE_DATA_KEY: &str = "state-data";
pub const STATE_DATA_KEY_UNCOMMITTED: &str = "state-data-uncommitted";
pub const STANDALONE_STATE_KEY: &str = "standalone-state";

// Device API endpoints, relative to the server URL.
pub const DEPLOYMENTS_NEXT_URI_V1: &str = "api/devices/v1/deployments/device/deployments/next";
pub const DEPLOYMENTS_NEXT_URI_V2: &str = "api/devices/v2/deployments/device/deployments/next";
pub const DEPLOYMENTS_STATUS_URI: &str = "api/devices/v1/deployments/device/deployments";
pub const INVENTORY_URI: &str = "api/devices/v1/inventory/device/attributes";

// Reported as the `mender_client_version` inventory attribute.
pub const MENDER_CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
