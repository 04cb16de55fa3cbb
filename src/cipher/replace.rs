use rand::seq::SliceRandom;

use super::{CipherError, Transform};

const TABLE_LEN: usize = 256;

/// Byte substitution: every byte value is replaced through a keyed
/// permutation of 0..=255.
#[derive(Clone)]
pub struct ReplaceCipher {
    encode: [u8; TABLE_LEN],
    decode: [u8; TABLE_LEN],
}

impl ReplaceCipher {
    pub fn new() -> Self {
        Self::from_table(random_table())
    }

    fn from_table(encode: [u8; TABLE_LEN]) -> Self {
        let mut decode = [0u8; TABLE_LEN];
        for (plain, &cipher) in encode.iter().enumerate() {
            decode[cipher as usize] = plain as u8;
        }
        ReplaceCipher { encode, decode }
    }
}

impl Default for ReplaceCipher {
    fn default() -> Self {
        Self::new()
    }
}

// A table with no fixed points, so no byte value passes through unchanged.
fn random_table() -> [u8; TABLE_LEN] {
    let mut rng = rand::thread_rng();
    let mut table = [0u8; TABLE_LEN];
    for (i, b) in table.iter_mut().enumerate() {
        *b = i as u8;
    }
    loop {
        table.shuffle(&mut rng);
        if table.iter().enumerate().all(|(i, &b)| i != b as usize) {
            return table;
        }
    }
}

impl Transform for ReplaceCipher {
    fn encrypt(&mut self, buf: &mut [u8]) {
        for b in buf {
            *b = self.encode[*b as usize];
        }
    }

    fn decrypt(&mut self, buf: &mut [u8]) {
        for b in buf {
            *b = self.decode[*b as usize];
        }
    }

    fn derive_key(&mut self, secret: &[u8]) -> Result<(), CipherError> {
        let table: [u8; TABLE_LEN] = secret
            .try_into()
            .map_err(|_| CipherError::InvalidKey("replace key must be 256 bytes"))?;
        let mut seen = [false; TABLE_LEN];
        for &b in &table {
            if std::mem::replace(&mut seen[b as usize], true) {
                return Err(CipherError::InvalidKey("replace key is not a permutation"));
            }
        }
        *self = Self::from_table(table);
        Ok(())
    }

    fn export_key(&self) -> Vec<u8> {
        self.encode.to_vec()
    }
}
