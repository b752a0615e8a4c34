//! Cursor/label colors for participants.
//!
//! Colors are CSS hex tokens from a fixed palette so every client renders
//! the same swatch for the same participant.

use uuid::Uuid;

use crate::transport::ClientId;

/// The participant palette.
pub const PALETTE: [&str; 10] = [
    "#958DF1", "#F98181", "#FBBC88", "#FAF594", "#70CFF8",
    "#94FADB", "#B9F18D", "#FF7DE9", "#FF97B5", "#FF9E66",
];

/// Picks colors from a palette.
#[derive(Debug, Clone)]
pub struct ColorAssigner {
    palette: Vec<String>,
}

impl ColorAssigner {
    /// Assigner over a custom palette. Falls back to [`PALETTE`] when
    /// `palette` is empty.
    pub fn new(palette: Vec<String>) -> Self {
        if palette.is_empty() {
            return Self::default();
        }
        Self { palette }
    }

    /// Uniform pick, seeded from a fresh v4 UUID.
    pub fn random(&self) -> String {
        self.pick(Uuid::new_v4().as_u128())
    }

    /// Stable pick for a client id.
    pub fn for_client(&self, id: ClientId) -> String {
        // splitmix64 finalizer spreads sequential ids over the palette
        let mut z = id.wrapping_add(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        self.pick((z ^ (z >> 31)) as u128)
    }

    pub fn palette(&self) -> &[String] {
        &self.palette
    }

    fn pick(&self, seed: u128) -> String {
        self.palette[(seed % self.palette.len() as u128) as usize].clone()
    }
}

impl Default for ColorAssigner {
    fn default() -> Self {
        Self {
            palette: PALETTE.iter().map(|c| c.to_string()).collect(),
        }
    }
}
