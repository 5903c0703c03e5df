//! Secure channel adapter.
//!
//! Wraps an external AEAD primitive with per-direction nonce management.
//! Both nonce counters start from a digest of the shared key. The low bit
//! tells client-originated traffic (0) from server-originated traffic (1),
//! and every message advances its counter by two, so each direction keeps
//! its own lane for the life of the connection.
//!
//! A sealed frame has `flags = 1`, the 8-byte header as associated data and
//! a body of `ciphertext || mac`.

use crate::{Result, XicError};
use sha2::{Digest, Sha256};

/// External authenticated-encryption primitive, one instance per direction.
pub trait AeadCipher: Send {
    /// Size of the authentication tag in bytes.
    fn mac_size(&self) -> usize;

    /// Begin a message with the given nonce and associated header.
    fn start(&mut self, nonce: &[u8], header: &[u8]);

    /// Encrypt or decrypt `input` into `out` (same length).
    fn update(&mut self, out: &mut [u8], input: &[u8]);

    /// Finish the message and write the computed tag.
    fn finish(&mut self, mac: &mut [u8]);
}

/// Direction a cipher instance works in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// Creates cipher instances keyed with a shared secret.
pub trait CipherFactory: Send + Sync {
    fn create(&self, key: &[u8], direction: Direction) -> Box<dyn AeadCipher>;
}

/// Which side of the connection this channel belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

pub struct SecureChannel {
    output: Box<dyn AeadCipher>,
    input: Box<dyn AeadCipher>,
    output_nonce: u64,
    input_nonce: u64,
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("output_nonce", &self.output_nonce)
            .field("input_nonce", &self.input_nonce)
            .finish_non_exhaustive()
    }
}

impl SecureChannel {
    pub fn new(factory: &dyn CipherFactory, shared_key: &[u8], role: Role) -> Self {
        let digest = Sha256::digest(shared_key);
        let mut seed = [0u8; 8];
        seed.copy_from_slice(&digest[..8]);
        let base = u64::from_be_bytes(seed);

        let client_lane = base & !1;
        let server_lane = base | 1;
        let (output_nonce, input_nonce) = match role {
            Role::Client => (client_lane, server_lane),
            Role::Server => (server_lane, client_lane),
        };

        Self {
            output: factory.create(shared_key, Direction::Encrypt),
            input: factory.create(shared_key, Direction::Decrypt),
            output_nonce,
            input_nonce,
        }
    }

    pub fn mac_size(&self) -> usize {
        self.output.mac_size()
    }

    pub fn output_start(&mut self, header: &[u8]) {
        self.output_nonce = self.output_nonce.wrapping_add(2);
        self.output.start(&self.output_nonce.to_be_bytes(), header);
    }

    pub fn output_update(&mut self, out: &mut [u8], input: &[u8]) {
        self.output.update(out, input);
    }

    pub fn output_finish(&mut self, mac: &mut [u8]) {
        self.output.finish(mac);
    }

    pub fn input_start(&mut self, header: &[u8]) {
        self.input_nonce = self.input_nonce.wrapping_add(2);
        self.input.start(&self.input_nonce.to_be_bytes(), header);
    }

    pub fn input_update(&mut self, out: &mut [u8], input: &[u8]) {
        self.input.update(out, input);
    }

    /// Whether the received tag matches the locally computed one.
    pub fn input_finish(&mut self, mac: &[u8]) -> bool {
        let mut expected = vec![0u8; self.input.mac_size()];
        self.input.finish(&mut expected);
        if expected.len() != mac.len() {
            return false;
        }
        expected
            .iter()
            .zip(mac)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    /// Encrypt `plaintext` into `ciphertext || mac`.
    pub fn seal(&mut self, header: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let mac_size = self.mac_size();
        let mut body = vec![0u8; plaintext.len() + mac_size];
        self.output_start(header);
        let (cipher, mac) = body.split_at_mut(plaintext.len());
        self.output_update(cipher, plaintext);
        self.output_finish(mac);
        body
    }

    /// Decrypt and verify `ciphertext || mac`.
    pub fn open(&mut self, header: &[u8], body: &[u8]) -> Result<Vec<u8>> {
        let mac_size = self.input.mac_size();
        if body.len() < mac_size {
            return Err(XicError::Authentication {
                message: format!("sealed body of {} bytes is shorter than its tag", body.len()),
            });
        }
        let (cipher, mac) = body.split_at(body.len() - mac_size);
        let mut plaintext = vec![0u8; cipher.len()];
        self.input_start(header);
        self.input_update(&mut plaintext, cipher);
        if !self.input_finish(mac) {
            return Err(XicError::Authentication {
                message: "message authentication code mismatch".to_string(),
            });
        }
        Ok(plaintext)
    }

    #[cfg(test)]
    pub(crate) fn nonces(&self) -> (u64, u64) {
        (self.output_nonce, self.input_nonce)
    }
}
