//! Scene dump encodings.
//!
//! Text dumps are pretty JSON. Binary dumps use this layout:
//! ```text
//! magic      8 bytes   b"SPSCENE\0"
//! format     u32 LE    BINARY_FORMAT_VERSION
//! digest     32 bytes  SHA-256 of the payload
//! payload    rest      zstd(CBOR(SceneFile))
//! ```

use crate::scene_file::SceneFile;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use spartan_scene::SceneError;
use std::io::{Read, Write};
use std::path::Path;

pub const MAGIC: &[u8; 8] = b"SPSCENE\0";
pub const BINARY_FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 8 + 4 + 32;

/// Errors from reading or writing scene dumps.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CBOR serialization error: {0}")]
    CborEncode(String),
    #[error("CBOR deserialization error: {0}")]
    CborDecode(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("not a binary scene dump")]
    BadMagic,
    #[error("truncated scene dump: {len} bytes")]
    Truncated { len: usize },
    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
    #[error("schema version mismatch: file has v{file_version}, expected v{expected_version}")]
    SchemaMismatch {
        file_version: u32,
        expected_version: u32,
    },
    #[error("invalid hierarchy: {0}")]
    Scene(#[from] SceneError),
}

/// Dump encoding, picked by extension or detected from content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Text,
    Binary,
}

impl Encoding {
    /// `.json` is text, anything else binary.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Text,
            _ => Self::Binary,
        }
    }
}

pub fn to_text(file: &SceneFile) -> Result<String, PersistError> {
    Ok(serde_json::to_string_pretty(file)?)
}

pub fn from_text(text: &str) -> Result<SceneFile, PersistError> {
    let file: SceneFile = serde_json::from_str(text)?;
    Ok(file)
}

pub fn to_binary(file: &SceneFile) -> Result<Vec<u8>, PersistError> {
    let cbor_bytes = cbor_serialize(file)?;
    let payload = zstd_compress(&cbor_bytes)?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&BINARY_FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&sha256(&payload));
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode a binary dump. Magic, format version and digest are checked
/// before the payload is decompressed.
pub fn from_binary(bytes: &[u8]) -> Result<SceneFile, PersistError> {
    if bytes.len() < HEADER_LEN {
        return Err(if bytes.starts_with(MAGIC) {
            PersistError::Truncated { len: bytes.len() }
        } else {
            PersistError::BadMagic
        });
    }
    if &bytes[..8] != MAGIC {
        return Err(PersistError::BadMagic);
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&bytes[8..12]);
    let version = u32::from_le_bytes(version);
    if version != BINARY_FORMAT_VERSION {
        return Err(PersistError::SchemaMismatch {
            file_version: version,
            expected_version: BINARY_FORMAT_VERSION,
        });
    }
    let expected = &bytes[12..HEADER_LEN];
    let payload = &bytes[HEADER_LEN..];
    let actual = sha256(payload);
    if expected != actual.as_slice() {
        return Err(PersistError::IntegrityMismatch {
            expected: hex(expected),
            actual: hex(&actual),
        });
    }
    let cbor_bytes = zstd_decompress(payload)?;
    cbor_deserialize(&cbor_bytes)
}

/// Decode either encoding by sniffing the magic header.
pub fn decode(bytes: &[u8]) -> Result<SceneFile, PersistError> {
    if bytes.starts_with(MAGIC) {
        from_binary(bytes)
    } else {
        let text = std::str::from_utf8(bytes).map_err(|_| PersistError::BadMagic)?;
        from_text(text)
    }
}

pub fn save_text(path: impl AsRef<Path>, file: &SceneFile) -> Result<(), PersistError> {
    std::fs::write(path.as_ref(), to_text(file)?)?;
    tracing::info!(
        path = %path.as_ref().display(),
        entities = file.entities.len(),
        "scene saved (text)"
    );
    Ok(())
}

pub fn load_text(path: impl AsRef<Path>) -> Result<SceneFile, PersistError> {
    from_text(&std::fs::read_to_string(path.as_ref())?)
}

pub fn save_binary(path: impl AsRef<Path>, file: &SceneFile) -> Result<(), PersistError> {
    std::fs::write(path.as_ref(), to_binary(file)?)?;
    tracing::info!(
        path = %path.as_ref().display(),
        entities = file.entities.len(),
        "scene saved (binary)"
    );
    Ok(())
}

pub fn load_binary(path: impl AsRef<Path>) -> Result<SceneFile, PersistError> {
    from_binary(&std::fs::read(path.as_ref())?)
}

/// Save with the encoding implied by the file extension.
pub fn save(path: impl AsRef<Path>, file: &SceneFile) -> Result<(), PersistError> {
    match Encoding::from_path(path.as_ref()) {
        Encoding::Text => save_text(path, file),
        Encoding::Binary => save_binary(path, file),
    }
}

/// Load a dump of either encoding.
pub fn load(path: impl AsRef<Path>) -> Result<SceneFile, PersistError> {
    let bytes = std::fs::read(path.as_ref())?;
    let file = decode(&bytes)?;
    tracing::info!(path = %path.as_ref().display(), entities = file.entities.len(), "scene loaded");
    Ok(file)
}

fn cbor_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, PersistError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| PersistError::CborEncode(e.to_string()))?;
    Ok(buf)
}

fn cbor_deserialize<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, PersistError> {
    ciborium::from_reader(data).map_err(|e| PersistError::CborDecode(e.to_string()))
}

fn zstd_compress(data: &[u8]) -> Result<Vec<u8>, PersistError> {
    let mut encoder = zstd::Encoder::new(Vec::new(), 3)?;
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn zstd_decompress(data: &[u8]) -> Result<Vec<u8>, PersistError> {
    let mut decoder = zstd::Decoder::new(data)?;
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf)?;
    Ok(buf)
}

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene_file::SCENE_SCHEMA_VERSION;
    use glam::Vec3;
    use spartan_common::{Color, Transform};
    use spartan_ecs::{Camera, ComponentStore, Light};
    use spartan_resources::ResourceCache;
    use spartan_scene::Scene;

    fn sample() -> SceneFile {
        let mut scene = Scene::new();
        let mut components = ComponentStore::new();
        let sun = scene.spawn(Transform::default());
        components.set_light(sun, Light::directional(Color::WHITE, 3.0));
        let cam = scene.spawn(Transform::from_position(Vec3::new(0.0, 2.0, 8.0)));
        components.set_camera(cam, Camera::default());
        SceneFile::capture(&scene, &components, &ResourceCache::new())
    }

    #[test]
    fn text_and_binary_decode_to_same_file() {
        let file = sample();
        let text = to_text(&file).unwrap();
        let binary = to_binary(&file).unwrap();
        assert_eq!(decode(text.as_bytes()).unwrap(), file);
        assert_eq!(decode(&binary).unwrap(), file);
    }

    #[test]
    fn corrupted_payload_fails_closed() {
        let mut bytes = to_binary(&sample()).unwrap();
        if let Some(byte) = bytes.last_mut() {
            *byte ^= 0xff;
        }
        assert!(matches!(
            from_binary(&bytes),
            Err(PersistError::IntegrityMismatch { .. })
        ));
    }

    #[test]
    fn unknown_binary_format_fails_closed() {
        let mut bytes = to_binary(&sample()).unwrap();
        bytes[8..12].copy_from_slice(&7u32.to_le_bytes());
        assert!(matches!(
            from_binary(&bytes),
            Err(PersistError::SchemaMismatch { file_version: 7, .. })
        ));
    }

    #[test]
    fn truncated_and_foreign_input() {
        assert!(matches!(
            from_binary(&MAGIC[..]),
            Err(PersistError::Truncated { len: 8 })
        ));
        assert!(matches!(from_binary(b"hello"), Err(PersistError::BadMagic)));
    }

    #[test]
    fn save_and_load_by_extension() {
        let tmp = tempfile::tempdir().unwrap();
        let file = sample();

        let text_path = tmp.path().join("level.json");
        let bin_path = tmp.path().join("level.scene");
        save(&text_path, &file).unwrap();
        save(&bin_path, &file).unwrap();

        assert!(std::fs::read_to_string(&text_path).unwrap().contains("\"version\""));
        assert!(std::fs::read(&bin_path).unwrap().starts_with(MAGIC));
        assert_eq!(load(&text_path).unwrap(), file);
        assert_eq!(load(&bin_path).unwrap(), file);
        assert_eq!(load_binary(&bin_path).unwrap().version, SCENE_SCHEMA_VERSION);
    }
}
