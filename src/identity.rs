use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use thiserror::Error;
use tracing as log;

use crate::config::EnvFile;
use crate::errors::Fault;
use crate::tooling::CipherPort;
use crate::utils::{exec_policy, hash};

pub const SERVER_ID_LEN: usize = 16;

/// Persisted per-host identity. The file is bound to the primary MAC: it
/// cannot be read after the disk moves to different hardware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    pub server_id: String,
    pub primary_mac: String,
    pub created_at: String,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity file checksum mismatch (file corrupted)")]
    ChecksumMismatch,
    #[error("identity file was created on different hardware (mac {expected} != {actual})")]
    MacMismatch { expected: String, actual: String },
    #[error("identity file is malformed")]
    Malformed,
}

// ---------------------------------------------------------------------------
// primary MAC discovery

/// First UP, non-loopback, non-virtual interface in kernel name order.
pub fn primary_mac() -> Result<String> {
    primary_mac_from_sysfs(Path::new("/sys/class/net"))
}

pub fn primary_mac_from_sysfs(root: &Path) -> Result<String> {
    let mut names: Vec<String> = fs::read_dir(root)
        .with_context(|| format!("scan {}", root.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();

    for name in names {
        if name == "lo" {
            continue;
        }
        let ifdir = root.join(&name);
        // virtual interfaces (bridges, bonds, veth) have no backing device
        if !ifdir.join("device").exists() {
            log::trace!("skip {name}: virtual interface");
            continue;
        }
        let state = fs::read_to_string(ifdir.join("operstate")).unwrap_or_default();
        if !state.trim().eq_ignore_ascii_case("up") {
            log::trace!("skip {name}: operstate {}", state.trim());
            continue;
        }
        let addr = fs::read_to_string(ifdir.join("address")).unwrap_or_default();
        if let Some(mac) = canonical_mac(addr.trim()) {
            return Ok(mac);
        }
    }
    bail!("no usable network interface found under {}", root.display())
}

pub fn canonical_mac(raw: &str) -> Option<String> {
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    let mut out = Vec::with_capacity(6);
    for p in parts {
        if p.len() != 2 || !p.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        out.push(p.to_ascii_lowercase());
    }
    let mac = out.join(":");
    if mac == "00:00:00:00:00:00" {
        return None;
    }
    Some(mac)
}

// ---------------------------------------------------------------------------
// server ID derivation

/// Seed for all derivations: SHA-256 over MAC and hostname.
pub fn identity_seed(mac: &str, hostname: &str) -> String {
    hash::hash_bytes(format!("{mac}{hostname}").as_bytes())
}

/// Extract decimal digits from the seed hex; repeat the sequence when it
/// is too short, truncate when too long. Deterministic and stable.
pub fn derive_server_id(mac: &str, hostname: &str) -> String {
    let seed = identity_seed(mac, hostname);
    let digits: String = seed.chars().filter(|c| c.is_ascii_digit()).collect();
    let digits = if digits.is_empty() {
        // hex happens to be all a-f: fall back to a hash of the seed,
        // mapping every nibble to a digit
        hash::hash_bytes(seed.as_bytes())
            .chars()
            .map(|c| {
                char::from_digit(c.to_digit(16).unwrap_or(0) % 10, 10).unwrap_or('0')
            })
            .collect()
    } else {
        digits
    };
    normalize_server_id("", &digits)
}

/// Bring `raw` to exactly 16 digits, filling from `seed_digits` (repeated
/// as needed). `normalize_server_id(x, s)` is stable under re-invocation.
pub fn normalize_server_id(raw: &str, seed_digits: &str) -> String {
    let mut out: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    out.truncate(SERVER_ID_LEN);
    if out.len() < SERVER_ID_LEN && !seed_digits.is_empty() {
        let filler = seed_digits
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect::<String>();
        if !filler.is_empty() {
            for c in filler.chars().cycle() {
                if out.len() >= SERVER_ID_LEN {
                    break;
                }
                out.push(c);
            }
        }
    }
    while out.len() < SERVER_ID_LEN {
        out.push('0');
    }
    out
}

// ---------------------------------------------------------------------------
// envelope

fn cipher_key_hex(mac: &str) -> String {
    hash::hash_bytes(format!("{mac}:proxsave-key").as_bytes())
}

fn cipher_iv_hex(mac: &str) -> String {
    hash::hash_bytes(format!("{mac}:proxsave-iv").as_bytes())[..32].to_string()
}

pub fn identity_path(base_dir: &Path) -> PathBuf {
    base_dir.join("env").join("server.identity")
}

/// Write the envelope: `SYSTEM_CONFIG_DATA="<b64>"` plus a checksum of the
/// ciphertext so corruption and wrong-hardware reads fail differently.
pub fn save(path: &Path, ident: &ServerIdentity, cipher: &dyn CipherPort) -> Result<()> {
    let plaintext = format!(
        "SERVER_ID={}\nPRIMARY_MAC={}\nCREATED_AT={}\n",
        ident.server_id, ident.primary_mac, ident.created_at
    );
    let b64 = cipher.encrypt_b64(
        &cipher_key_hex(&ident.primary_mac),
        &cipher_iv_hex(&ident.primary_mac),
        plaintext.as_bytes(),
    )?;
    let envelope = format!(
        "SYSTEM_CONFIG_DATA=\"{b64}\"\nCHECKSUM={}\n",
        hash::hash_bytes(b64.as_bytes())
    );

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, envelope).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("rename to {}", path.display()))?;
    Ok(())
}

pub fn load(path: &Path, live_mac: &str, cipher: &dyn CipherPort) -> Result<ServerIdentity> {
    let text =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let env = EnvFile::parse(&text);

    let b64 = env
        .get("SYSTEM_CONFIG_DATA")
        .ok_or(IdentityError::Malformed)?
        .to_string();
    let checksum = env.get("CHECKSUM").ok_or(IdentityError::Malformed)?;

    if hash::hash_bytes(b64.as_bytes()) != checksum {
        return Err(IdentityError::ChecksumMismatch.into());
    }

    let plaintext = match cipher.decrypt_b64(
        &cipher_key_hex(live_mac),
        &cipher_iv_hex(live_mac),
        &b64,
    ) {
        Ok(p) => p,
        // checksum was valid, so the bytes are intact: a failing decrypt
        // means the key (and therefore the MAC) is different
        Err(_) => {
            return Err(IdentityError::MacMismatch {
                expected: "<sealed>".to_string(),
                actual: live_mac.to_string(),
            }
            .into());
        }
    };

    let inner = EnvFile::parse(&String::from_utf8_lossy(&plaintext));
    let server_id = inner
        .get("SERVER_ID")
        .ok_or(IdentityError::Malformed)?
        .to_string();
    let primary_mac = inner
        .get("PRIMARY_MAC")
        .ok_or(IdentityError::Malformed)?
        .to_string();
    let created_at = inner.get("CREATED_AT").unwrap_or_default().to_string();

    if primary_mac != live_mac {
        return Err(IdentityError::MacMismatch {
            expected: primary_mac,
            actual: live_mac.to_string(),
        }
        .into());
    }
    if server_id.len() != SERVER_ID_LEN || !server_id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(IdentityError::Malformed.into());
    }

    Ok(ServerIdentity {
        server_id,
        primary_mac,
        created_at,
    })
}

/// Load the persisted identity, creating it on first run. Dry-run derives
/// without persisting.
pub fn resolve(
    base_dir: &Path,
    hostname: &str,
    cipher: &dyn CipherPort,
) -> Result<ServerIdentity> {
    let path = identity_path(base_dir);
    let mac = primary_mac().context(Fault::Environment)?;

    if path.exists() {
        return load(&path, &mac, cipher).context(Fault::Security);
    }

    let ident = ServerIdentity {
        server_id: derive_server_id(&mac, hostname),
        primary_mac: mac,
        created_at: crate::utils::time::fmt_utc(crate::utils::time::current_epoch())?,
    };
    if exec_policy::is_dry_run() {
        log::info!("DRY-RUN: would persist server identity to {}", path.display());
    } else {
        save(&path, &ident, cipher).context(Fault::Environment)?;
        log::info!("server identity created: id={}", ident.server_id);
    }
    Ok(ident)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use tempfile::TempDir;

    /// Test double: "encrypts" by binding the payload to the key. Wrong
    /// key on decrypt fails like `openssl enc -d` does.
    struct KeyBoundCipher;

    fn to_hex(data: &[u8]) -> String {
        data.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn from_hex(s: &str) -> Option<Vec<u8>> {
        if s.len() % 2 != 0 {
            return None;
        }
        (0..s.len() / 2)
            .map(|i| u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok())
            .collect()
    }

    impl CipherPort for KeyBoundCipher {
        fn encrypt_b64(&self, key_hex: &str, _iv: &str, plaintext: &[u8]) -> Result<String> {
            Ok(format!("{key_hex}.{}", to_hex(plaintext)))
        }

        fn decrypt_b64(&self, key_hex: &str, _iv: &str, b64: &str) -> Result<Vec<u8>> {
            let (key, payload) = b64.split_once('.').ok_or_else(|| anyhow!("bad format"))?;
            if key != key_hex {
                anyhow::bail!("bad decrypt");
            }
            from_hex(payload).ok_or_else(|| anyhow!("bad payload"))
        }
    }

    const MAC_A: &str = "aa:bb:cc:dd:ee:ff";
    const MAC_B: &str = "11:22:33:44:55:66";

    fn ident() -> ServerIdentity {
        ServerIdentity {
            server_id: derive_server_id(MAC_A, "node01"),
            primary_mac: MAC_A.to_string(),
            created_at: "2025-03-14T07:00:00Z".to_string(),
        }
    }

    #[test]
    fn server_id_is_16_digits_and_deterministic() {
        let a = derive_server_id(MAC_A, "node01");
        let b = derive_server_id(MAC_A, "node01");
        assert_eq!(a, b);
        assert_eq!(a.len(), SERVER_ID_LEN);
        assert!(a.bytes().all(|c| c.is_ascii_digit()));

        // different host, different id
        assert_ne!(a, derive_server_id(MAC_B, "node01"));
        assert_ne!(a, derive_server_id(MAC_A, "node02"));
    }

    #[test]
    fn normalize_pads_by_repeating_and_truncates() {
        assert_eq!(normalize_server_id("123", "456"), "1234564564564564");
        assert_eq!(
            normalize_server_id("123456789012345678", ""),
            "1234567890123456"
        );
        // non-digits are stripped before length logic
        assert_eq!(normalize_server_id("1a2b3c", "9"), "1239999999999999");
        // stability
        let once = normalize_server_id("42", "137");
        assert_eq!(normalize_server_id(&once, "137"), once);
    }

    #[test]
    fn envelope_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("server.identity");
        let cipher = KeyBoundCipher;

        save(&path, &ident(), &cipher).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("SYSTEM_CONFIG_DATA=\""));
        assert!(text.contains("CHECKSUM="));
        assert!(!text.contains(&ident().server_id), "id leaked in cleartext");

        let loaded = load(&path, MAC_A, &cipher).unwrap();
        assert_eq!(loaded, ident());
    }

    #[test]
    fn corrupted_file_reports_checksum_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("server.identity");
        let cipher = KeyBoundCipher;
        save(&path, &ident(), &cipher).unwrap();

        let mangled = std::fs::read_to_string(&path)
            .unwrap()
            .replace("SYSTEM_CONFIG_DATA=\"", "SYSTEM_CONFIG_DATA=\"ff");
        std::fs::write(&path, mangled).unwrap();

        let err = load(&path, MAC_A, &cipher).unwrap_err();
        assert!(
            matches!(
                err.downcast_ref::<IdentityError>(),
                Some(IdentityError::ChecksumMismatch)
            ),
            "err: {err:#}"
        );
    }

    #[test]
    fn different_mac_reports_mismatch_not_corruption() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("server.identity");
        let cipher = KeyBoundCipher;
        save(&path, &ident(), &cipher).unwrap();

        let err = load(&path, MAC_B, &cipher).unwrap_err();
        assert!(
            matches!(
                err.downcast_ref::<IdentityError>(),
                Some(IdentityError::MacMismatch { .. })
            ),
            "err: {err:#}"
        );
    }

    #[test]
    fn sysfs_scan_picks_first_up_physical_interface() {
        let tmp = TempDir::new().unwrap();
        let net = tmp.path().join("net");

        let mk = |name: &str, state: &str, addr: &str, physical: bool| {
            let d = net.join(name);
            std::fs::create_dir_all(&d).unwrap();
            std::fs::write(d.join("operstate"), state).unwrap();
            std::fs::write(d.join("address"), addr).unwrap();
            if physical {
                std::fs::create_dir(d.join("device")).unwrap();
            }
        };

        mk("lo", "up", "00:00:00:00:00:00", false);
        mk("eth0", "down", "AA:BB:CC:00:00:01", true);
        mk("eth1", "up", "AA:BB:CC:00:00:02", true);
        mk("vmbr0", "up", "aa:bb:cc:00:00:03", false);

        let mac = primary_mac_from_sysfs(&net).unwrap();
        assert_eq!(mac, "aa:bb:cc:00:00:02");
    }

    #[test]
    fn sysfs_scan_fails_when_nothing_usable() {
        let tmp = TempDir::new().unwrap();
        let net = tmp.path().join("net");
        std::fs::create_dir_all(net.join("lo")).unwrap();
        assert!(primary_mac_from_sysfs(&net).is_err());
    }

    #[test]
    fn canonical_mac_validates_and_lowercases() {
        assert_eq!(
            canonical_mac("AA:BB:CC:DD:EE:FF").as_deref(),
            Some("aa:bb:cc:dd:ee:ff")
        );
        assert!(canonical_mac("00:00:00:00:00:00").is_none());
        assert!(canonical_mac("aabbccddeeff").is_none());
        assert!(canonical_mac("zz:bb:cc:dd:ee:ff").is_none());
    }
}
