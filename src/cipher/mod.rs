mod replace;

use std::fmt;
use std::str::FromStr;

pub use replace::ReplaceCipher;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("unknown cipher mode: {0}")]
    UnknownMode(String),
    #[error("invalid key: {0}")]
    InvalidKey(&'static str),
}

/// A length-preserving stream transform applied to every byte that crosses
/// the client-facing socket.
///
/// Both directions work in place, so the output is always exactly as long as
/// the input. Calls are sequential: an instance must see the bytes of one
/// direction in wire order.
pub trait Transform: Send {
    fn encrypt(&mut self, buf: &mut [u8]);
    fn decrypt(&mut self, buf: &mut [u8]);

    /// Resets the transform state from `secret`, as previously returned by
    /// [`Transform::export_key`].
    fn derive_key(&mut self, secret: &[u8]) -> Result<(), CipherError>;

    fn export_key(&self) -> Vec<u8>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Replace,
}

impl Mode {
    /// Returns a fresh, randomly keyed transform.
    pub fn instantiate(self) -> Box<dyn Transform> {
        match self {
            Mode::Replace => Box::new(ReplaceCipher::new()),
        }
    }

    pub fn generate_key(self) -> Vec<u8> {
        self.instantiate().export_key()
    }
}

impl FromStr for Mode {
    type Err = CipherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "replace" => Ok(Mode::Replace),
            other => Err(CipherError::UnknownMode(other.to_owned())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Replace => f.write_str("replace"),
        }
    }
}

/// Process-wide cipher settings. Holds only the immutable key; every
/// connection direction gets its own [`Transform`] derived from it.
#[derive(Clone)]
pub struct Cipher {
    mode: Mode,
    key: Vec<u8>,
}

impl Cipher {
    pub fn new(mode: Mode, key: Vec<u8>) -> Result<Self, CipherError> {
        let cipher = Cipher { mode, key };
        // reject a bad key at startup rather than on the first connection
        cipher.transform()?;
        Ok(cipher)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn transform(&self) -> Result<Box<dyn Transform>, CipherError> {
        let mut t = self.mode.instantiate();
        t.derive_key(&self.key)?;
        Ok(t)
    }
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}
