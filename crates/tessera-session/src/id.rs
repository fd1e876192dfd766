//! Session identifier generation.
//!
//! Random bytes are fed through a digest and rendered as uppercase hex,
//! repeated until the configured number of bytes is produced. Randomness
//! comes from a configured device file; when none is configured or it
//! cannot be read, a PRNG seeded from the current time mixed with an
//! optional entropy string is used instead.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use tracing::{debug, warn};

use crate::error::Error;

/// Default number of digest bytes in an id (rendered as twice as many hex characters).
pub const DEFAULT_ID_LENGTH_BYTES: usize = 16;

/// Digest applied to random bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha224,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    fn digest(self, bytes: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha224 => Sha224::digest(bytes).to_vec(),
            Self::Sha256 => Sha256::digest(bytes).to_vec(),
            Self::Sha384 => Sha384::digest(bytes).to_vec(),
            Self::Sha512 => Sha512::digest(bytes).to_vec(),
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "sha224" => Ok(Self::Sha224),
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            other => Err(Error::Config(format!("unknown digest algorithm '{other}'"))),
        }
    }
}

/// Identifier generation settings.
#[derive(Debug, Clone)]
pub struct IdConfig {
    pub algorithm: DigestAlgorithm,

    /// Digest bytes per id.
    pub length_bytes: usize,

    /// Device or file to read random bytes from.
    pub random_file: Option<PathBuf>,

    /// Mixed into the seed of the fallback PRNG.
    pub entropy: Option<String>,

    /// Routing token appended as `.<route>`.
    pub route: Option<String>,
}

impl Default for IdConfig {
    fn default() -> Self {
        Self {
            algorithm: DigestAlgorithm::default(),
            length_bytes: DEFAULT_ID_LENGTH_BYTES,
            random_file: cfg!(unix).then(|| PathBuf::from("/dev/urandom")),
            entropy: None,
            route: None,
        }
    }
}

impl IdConfig {
    pub fn with_algorithm(mut self, algorithm: DigestAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_length_bytes(mut self, length: usize) -> Self {
        self.length_bytes = length;
        self
    }

    pub fn with_random_file(mut self, path: Option<PathBuf>) -> Self {
        self.random_file = path;
        self
    }

    pub fn with_entropy(mut self, entropy: impl Into<String>) -> Self {
        self.entropy = Some(entropy.into());
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }
}

enum RandomSource {
    File(File),
    Seeded(StdRng),
}

/// Produces candidate session ids.
///
/// Uniqueness against live sessions is enforced by the registry, which
/// owns the generator behind the same lock as its session map.
pub struct IdGenerator {
    config: IdConfig,
    source: Option<RandomSource>,
}

impl IdGenerator {
    /// The random source is opened on first use.
    pub fn new(config: IdConfig) -> Self {
        Self {
            config,
            source: None,
        }
    }

    pub fn config(&self) -> &IdConfig {
        &self.config
    }

    /// Generate one candidate id.
    pub fn generate(&mut self) -> String {
        let length = self.config.length_bytes.max(1);
        let mut id = String::with_capacity(length * 2);
        let mut produced = 0;
        while produced < length {
            let mut random = [0u8; 16];
            self.fill_random(&mut random);
            let digest = self.config.algorithm.digest(&random);
            let take = digest.len().min(length - produced);
            id.push_str(&hex::encode_upper(&digest[..take]));
            produced += take;
        }
        if let Some(route) = &self.config.route {
            id.push('.');
            id.push_str(route);
        }
        id
    }

    fn fill_random(&mut self, buf: &mut [u8]) {
        if self.source.is_none() {
            self.source = Some(self.open_source());
        }
        if let Some(RandomSource::File(file)) = &mut self.source {
            match file.read_exact(buf) {
                Ok(()) => return,
                Err(e) => {
                    warn!(error = %e, "Random file read failed, falling back to seeded generator");
                    self.source = Some(RandomSource::Seeded(seeded_rng(self.config.entropy.as_deref())));
                }
            }
        }
        if let Some(RandomSource::Seeded(rng)) = &mut self.source {
            rng.fill_bytes(buf);
        }
    }

    fn open_source(&self) -> RandomSource {
        if let Some(path) = &self.config.random_file {
            match File::open(path) {
                Ok(file) => {
                    debug!(path = %path.display(), "Reading session id randomness from file");
                    return RandomSource::File(file);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot open random file, using seeded generator");
                }
            }
        }
        RandomSource::Seeded(seeded_rng(self.config.entropy.as_deref()))
    }
}

/// PRNG seeded from the current time mixed with `entropy`.
fn seeded_rng(entropy: Option<&str>) -> StdRng {
    let mut seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    if let Some(entropy) = entropy {
        let digest = Sha256::digest(entropy.as_bytes());
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest[..8]);
        seed ^= u64::from_le_bytes(word);
    }
    StdRng::seed_from_u64(seed)
}
