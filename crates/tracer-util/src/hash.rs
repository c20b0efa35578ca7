use rustc_hash::FxHasher;
use std::fs::File;
use std::hash::Hasher;
use std::io::{self, BufReader, Read};
use std::path::Path;

/// Compute the BLAKE3 hash of a file, returning the hex-encoded digest.
///
/// Streams the file content to minimize memory usage. Used for the module
/// dependency tree hash (digest over lockfiles) that namespaces the
/// package/module resolver cache directories.
///
/// # Errors
/// Returns an error if the file cannot be opened or read.
pub fn blake3_file(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// Compute the BLAKE3 hash of a byte slice, returning the hex-encoded digest.
#[must_use]
pub fn blake3_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Combine several digests (e.g. one per lockfile) into a single stable digest.
///
/// Inputs are hashed in the order given, each length-prefixed so that
/// `["a", "bb"]` and `["ab", "b"]` never collide.
#[must_use]
pub fn blake3_combine<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Non-cryptographic 32-bit hash of text, rendered in decimal.
///
/// This is the record store's `hashText` job: a cheap content identity used
/// for cache-busting URLs, not a security boundary. Truncating `FxHasher`'s
/// 64-bit output to `u32` is deterministic within a process and across runs
/// (unlike `std`'s `RandomState`, `FxHasher` has no per-process seed).
#[must_use]
pub fn fx_hash32_text(text: &str) -> u32 {
    let mut hasher = FxHasher::default();
    hasher.write(text.as_bytes());
    (hasher.finish() & 0xFFFF_FFFF) as u32
}
