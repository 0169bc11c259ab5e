//! The shared-secret authentication cookie.
//!
//! A cookie is 256 opaque bytes compared byte-for-byte by the server. The
//! first client run mints one and stores it with owner-only permissions;
//! every subsequent client and the local daemon read the same file.

use std::{
    io::{self, Read, Write},
    os::unix::fs::OpenOptionsExt,
    path::Path,
};

use rand::RngCore;
use tracing::{debug, info};

pub const COOKIE_LENGTH: usize = 256;

pub fn load_or_generate(path: &Path) -> io::Result<Vec<u8>> {
    match std::fs::File::open(path) {
        Ok(mut f) => {
            let mut cookie = Vec::with_capacity(COOKIE_LENGTH);
            f.read_to_end(&mut cookie)?;
            if cookie.len() != COOKIE_LENGTH {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("cookie file holds {} bytes, expected {COOKIE_LENGTH}", cookie.len()),
                ));
            }
            debug!(path = %path.display(), "loaded auth cookie");
            Ok(cookie)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let mut cookie = vec![0u8; COOKIE_LENGTH];
            rand::rng().fill_bytes(&mut cookie);

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            match std::fs::OpenOptions::new().write(true).create_new(true).mode(0o600).open(path)
            {
                Ok(mut f) => {
                    f.write_all(&cookie)?;
                    info!(path = %path.display(), "generated new auth cookie");
                    Ok(cookie)
                }
                // Another client won the race; use its cookie.
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => load_or_generate(path),
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    }
}
