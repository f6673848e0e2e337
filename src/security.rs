//! Security Gate (C7, spec.md §4.7).
//!
//! Three enforcement points, each backed by a small state file read once
//! per flow (sampled, not locked — spec.md §4.7 "values are read once
//! per flow at hook entry"). Grounded on the teacher's general
//! preference for the `rand` crate for security-sensitive randomness
//! (seen across the pack, e.g. `vishalbelsare-agentgateway`'s TLS/JWT
//! code paths) and on `config.rs`'s state-file-reading idiom.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use rand::RngCore;

use crate::error::ErrSecurity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
	Local,
	Network,
}

impl NetworkMode {
	pub fn bind_host(self) -> &'static str {
		match self {
			NetworkMode::Local => "127.0.0.1",
			NetworkMode::Network => "0.0.0.0",
		}
	}

	fn parse(s: &str) -> Option<Self> {
		match s.trim() {
			"local" => Some(NetworkMode::Local),
			"network" => Some(NetworkMode::Network),
			_ => None,
		}
	}
}

/// Atomic scalar flags sampled at hook entry (Design Note §9: "Three
/// atomic scalars... plus one owner-only token file"). Reload of the
/// underlying state files only needs to flip these; no lock is ever
/// held across a flow's extraction.
pub struct SecurityGate {
	network_mode_is_network: AtomicBool,
	debug_mode_is_on: AtomicBool,
	admin_token: String,
}

impl SecurityGate {
	/// Reads `network_mode`, `debug_mode`, and `admin.token` from
	/// `state_dir`, generating the admin token file on first access.
	/// Emits the WARN-level startup banners spec.md §4.7 requires for
	/// `network` mode and `debug_mode = on`. Fails with `ErrSecurity` if
	/// the token file's permissions are looser than owner-only.
	pub fn load(state_dir: &Path) -> Result<Self, ErrSecurity> {
		let network_mode = read_mode_file(&state_dir.join("network_mode"), NetworkMode::parse)?.unwrap_or(NetworkMode::Local);
		let debug_mode = read_mode_file(&state_dir.join("debug_mode"), |s| match s.trim() {
			"on" => Some(true),
			"off" => Some(false),
			_ => None,
		})?
		.unwrap_or(false);

		if network_mode == NetworkMode::Network {
			tracing::warn!("tokentap is bound to 0.0.0.0 (network mode) — reachable from outside this host");
		}
		if debug_mode {
			tracing::warn!("tokentap debug mode is ON — raw request/response bodies and unredacted message content will be recorded");
		}

		let admin_token = load_or_generate_admin_token(&state_dir.join("admin.token"))?;

		Ok(SecurityGate {
			network_mode_is_network: AtomicBool::new(network_mode == NetworkMode::Network),
			debug_mode_is_on: AtomicBool::new(debug_mode),
			admin_token,
		})
	}

	pub fn network_mode(&self) -> NetworkMode {
		if self.network_mode_is_network.load(Ordering::Relaxed) {
			NetworkMode::Network
		} else {
			NetworkMode::Local
		}
	}

	pub fn capture_full_enabled_globally(&self) -> bool {
		self.debug_mode_is_on.load(Ordering::Relaxed)
	}

	/// Verifies `X-Admin-Token` against the stored token. Destructive
	/// dashboard endpoints only (spec.md §4.7) — the proxy path never
	/// calls this.
	pub fn verify_admin_token(&self, provided: Option<&str>) -> Result<(), ErrSecurity> {
		match provided {
			Some(token) if constant_time_eq(token.as_bytes(), self.admin_token.as_bytes()) => Ok(()),
			_ => Err(ErrSecurity::Unauthorized),
		}
	}
}

fn read_mode_file<T>(path: &Path, parse: impl Fn(&str) -> Option<T>) -> Result<Option<T>, ErrSecurity> {
	if !path.exists() {
		return Ok(None);
	}
	let text = std::fs::read_to_string(path).map_err(|e| ErrSecurity::Io {
		path: path.display().to_string(),
		source: e,
	})?;
	Ok(parse(&text))
}

#[cfg(unix)]
fn check_owner_only_permissions(path: &Path) -> Result<(), ErrSecurity> {
	use std::os::unix::fs::PermissionsExt;
	let meta = std::fs::metadata(path).map_err(|e| ErrSecurity::Io {
		path: path.display().to_string(),
		source: e,
	})?;
	let mode = meta.permissions().mode() & 0o777;
	if mode != 0o600 {
		return Err(ErrSecurity::LoosePermissions {
			path: path.display().to_string(),
			mode,
		});
	}
	Ok(())
}

#[cfg(not(unix))]
fn check_owner_only_permissions(_path: &Path) -> Result<(), ErrSecurity> {
	Ok(())
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> std::io::Result<()> {
	use std::os::unix::fs::PermissionsExt;
	std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) -> std::io::Result<()> {
	Ok(())
}

fn load_or_generate_admin_token(path: &Path) -> Result<String, ErrSecurity> {
	if path.exists() {
		check_owner_only_permissions(path)?;
		let raw = std::fs::read_to_string(path).map_err(|e| ErrSecurity::Io {
			path: path.display().to_string(),
			source: e,
		})?;
		return Ok(raw.trim().to_string());
	}
	let mut bytes = [0u8; 32];
	rand::thread_rng().fill_bytes(&mut bytes);
	let token = hex::encode(bytes);
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent).map_err(|e| ErrSecurity::Io {
			path: parent.display().to_string(),
			source: e,
		})?;
	}
	std::fs::write(path, &token).map_err(|e| ErrSecurity::Io {
		path: path.display().to_string(),
		source: e,
	})?;
	set_owner_only_permissions(path).map_err(|e| ErrSecurity::Io {
		path: path.display().to_string(),
		source: e,
	})?;
	Ok(token)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}
	a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Resolves state-file paths under a single `state_dir` root.
pub fn state_paths(state_dir: &Path) -> (PathBuf, PathBuf, PathBuf) {
	(
		state_dir.join("network_mode"),
		state_dir.join("debug_mode"),
		state_dir.join("admin.token"),
	)
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	#[test]
	fn defaults_to_local_and_debug_off_when_no_state_files() {
		let dir = tempdir().unwrap();
		let gate = SecurityGate::load(dir.path()).unwrap();
		assert_eq!(gate.network_mode(), NetworkMode::Local);
		assert!(!gate.capture_full_enabled_globally());
	}

	#[test]
	fn generates_admin_token_with_owner_only_permissions() {
		let dir = tempdir().unwrap();
		let gate = SecurityGate::load(dir.path()).unwrap();
		assert!(gate.verify_admin_token(None).is_err());

		let token_path = dir.path().join("admin.token");
		assert!(token_path.exists());
		#[cfg(unix)]
		{
			use std::os::unix::fs::PermissionsExt;
			let mode = std::fs::metadata(&token_path).unwrap().permissions().mode() & 0o777;
			assert_eq!(mode, 0o600);
		}
	}

	#[test]
	fn scenario_six_admin_token_protection() {
		let dir = tempdir().unwrap();
		let gate = SecurityGate::load(dir.path()).unwrap();
		let token = std::fs::read_to_string(dir.path().join("admin.token")).unwrap();

		assert!(gate.verify_admin_token(None).is_err(), "missing header -> 403");
		assert!(gate.verify_admin_token(Some("wrong")).is_err(), "wrong header -> 403");
		assert!(gate.verify_admin_token(Some(token.trim())).is_ok(), "correct header -> ok");
	}

	#[cfg(unix)]
	#[test]
	fn refuses_to_start_with_loose_token_file_permissions() {
		use std::io::Write;
		use std::os::unix::fs::PermissionsExt;

		let dir = tempdir().unwrap();
		let token_path = dir.path().join("admin.token");
		let mut f = std::fs::File::create(&token_path).unwrap();
		f.write_all(b"deadbeef").unwrap();
		std::fs::set_permissions(&token_path, std::fs::Permissions::from_mode(0o644)).unwrap();

		let err = SecurityGate::load(dir.path()).unwrap_err();
		assert!(matches!(err, ErrSecurity::LoosePermissions { .. }));
	}

	#[test]
	fn network_mode_file_selects_wildcard_bind() {
		let dir = tempdir().unwrap();
		std::fs::write(dir.path().join("network_mode"), "network").unwrap();
		let gate = SecurityGate::load(dir.path()).unwrap();
		assert_eq!(gate.network_mode(), NetworkMode::Network);
		assert_eq!(gate.network_mode().bind_host(), "0.0.0.0");
	}
}
