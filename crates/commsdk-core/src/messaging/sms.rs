//! SMS segmentation.
//!
//! Text made only of GSM 03.38 default-alphabet characters is single-byte and
//! fits 160 units per segment (extension-table characters take two units).
//! Any other character switches the whole message to double-byte, 70
//! characters per segment.

/// Units per single-byte segment.
pub const SINGLE_BYTE_LIMIT: usize = 160;
/// Characters per double-byte segment.
pub const DOUBLE_BYTE_LIMIT: usize = 70;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmsEncoding {
    SingleByte,
    DoubleByte,
}

impl SmsEncoding {
    pub fn segment_limit(self) -> usize {
        match self {
            Self::SingleByte => SINGLE_BYTE_LIMIT,
            Self::DoubleByte => DOUBLE_BYTE_LIMIT,
        }
    }
}

const GSM_BASIC: &str = "@£$¥èéùìòÇ\nØø\rÅåΔ_ΦΓΛΩΠΨΣΘΞÆæßÉ !\"#¤%&'()*+,-./0123456789:;<=>?\
¡ABCDEFGHIJKLMNOPQRSTUVWXYZÄÖÑÜ§¿abcdefghijklmnopqrstuvwxyzäöñüà";

const GSM_EXTENSION: &str = "\u{000C}^{}\\[~]|€";

/// GSM units for `c`, or `None` if it needs double-byte encoding.
fn gsm_units(c: char) -> Option<usize> {
    if GSM_BASIC.contains(c) {
        Some(1)
    } else if GSM_EXTENSION.contains(c) {
        Some(2)
    } else {
        None
    }
}

pub fn encoding_for(text: &str) -> SmsEncoding {
    if text.chars().all(|c| gsm_units(c).is_some()) {
        SmsEncoding::SingleByte
    } else {
        SmsEncoding::DoubleByte
    }
}

/// Split `text` into billed segments. Empty text is one empty segment.
pub fn segment(text: &str) -> (SmsEncoding, Vec<String>) {
    let encoding = encoding_for(text);
    let limit = encoding.segment_limit();

    let mut segments = Vec::new();
    let mut current = String::new();
    let mut used = 0;
    for c in text.chars() {
        let units = match encoding {
            SmsEncoding::SingleByte => gsm_units(c).unwrap_or(1),
            SmsEncoding::DoubleByte => c.len_utf16(),
        };
        if used + units > limit {
            segments.push(std::mem::take(&mut current));
            used = 0;
        }
        current.push(c);
        used += units;
    }
    if !current.is_empty() || segments.is_empty() {
        segments.push(current);
    }
    (encoding, segments)
}

pub fn segment_count(text: &str) -> usize {
    segment(text).1.len()
}
