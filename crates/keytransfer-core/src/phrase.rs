//! Comparison phrases for pairing without a scanned descriptor.
//!
//! When the key is typed in by hand there is no secret shared out of band, so
//! the handshake runs unkeyed and both users compare a short word sequence
//! derived from the handshake transcript. A relaying attacker ends up with two
//! different transcripts and therefore two different phrases.

use std::fmt;

use sha2::{Digest, Sha256};

const PHRASE_LABEL: &[u8] = b"keytransfer/v1 comparison phrase";
const PHRASE_WORDS: usize = 4;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ComparisonPhrase(String);

impl ComparisonPhrase {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn words(&self) -> impl Iterator<Item = &str> {
        self.0.split(' ')
    }
}

impl fmt::Display for ComparisonPhrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the phrase both peers display. Pure: equal input, equal phrase.
pub fn derive_phrase(material: &[u8]) -> ComparisonPhrase {
    let mut hasher = Sha256::new();
    hasher.update(PHRASE_LABEL);
    hasher.update(material);
    let digest = hasher.finalize();

    let words: Vec<&str> = digest[..PHRASE_WORDS]
        .iter()
        .map(|b| WORDS[*b as usize])
        .collect();
    ComparisonPhrase(words.join(" "))
}

static WORDS: [&str; 256] = [
    "acid", "acorn", "agent", "alarm", "album", "alien", "alley", "amber",
    "anchor", "angle", "ankle", "apple", "apron", "arena", "arrow", "atlas",
    "attic", "autumn", "avenue", "bacon", "badge", "bagel", "baker", "bamboo",
    "banjo", "barrel", "basket", "beach", "beacon", "beetle", "bell", "bench",
    "berry", "bicycle", "bison", "blanket", "blossom", "boat", "bonfire", "border",
    "bottle", "boulder", "bracket", "branch", "brick", "bridge", "broom", "bubble",
    "bucket", "buffalo", "bugle", "button", "cabin", "cactus", "camera", "camel",
    "candle", "canoe", "canyon", "carpet", "castle", "cello", "cement", "chalk",
    "cherry", "chess", "chimney", "cider", "cinema", "circus", "citrus", "claw",
    "cliff", "cloud", "clover", "cobalt", "cocoa", "comet", "copper", "coral",
    "cotton", "cougar", "crane", "crayon", "cricket", "crown", "cube", "cupboard",
    "dagger", "daisy", "delta", "desert", "diamond", "dingo", "dolphin", "domino",
    "donkey", "dragon", "drum", "dune", "eagle", "easel", "echo", "elbow",
    "ember", "engine", "falcon", "feather", "fence", "fern", "ferry", "fiddle",
    "fig", "flame", "flute", "forest", "fossil", "fountain", "fox", "galaxy",
    "garden", "garlic", "geyser", "ginger", "glacier", "globe", "goblet", "gopher",
    "granite", "grape", "gravel", "guitar", "hammer", "harbor", "harp", "hazel",
    "hedge", "helmet", "heron", "hollow", "honey", "horizon", "hornet", "igloo",
    "iris", "island", "ivory", "jacket", "jaguar", "jasmine", "jelly", "jigsaw",
    "jungle", "kayak", "kernel", "kettle", "kite", "koala", "ladder", "lagoon",
    "lantern", "lemon", "lentil", "lilac", "lizard", "lobster", "locket", "lotus",
    "magnet", "mango", "maple", "marble", "meadow", "melon", "mirror", "mitten",
    "monsoon", "mosaic", "muffin", "napkin", "nectar", "needle", "nickel", "nutmeg",
    "oasis", "ocean", "olive", "onion", "orbit", "orchid", "otter", "oyster",
    "paddle", "pagoda", "panda", "parrot", "pebble", "pelican", "pepper", "piano",
    "pillow", "pine", "pixel", "planet", "plume", "pocket", "pony", "poppy",
    "prairie", "pretzel", "puzzle", "quartz", "quill", "rabbit", "radar", "raven",
    "reef", "ribbon", "river", "robin", "rocket", "saddle", "saffron", "salmon",
    "sandal", "satchel", "scarf", "shovel", "silver", "sparrow", "spider", "sponge",
    "spruce", "squid", "statue", "summit", "sunset", "tablet", "tango", "teapot",
    "thistle", "thunder", "tiger", "timber", "toast", "tomato", "topaz", "tornado",
    "trumpet", "tulip", "tundra", "turtle", "umbrella", "valley", "velvet", "violin",
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn word_list_has_no_duplicates() {
        let unique: HashSet<&str> = WORDS.iter().copied().collect();
        assert_eq!(unique.len(), WORDS.len());
    }

    #[test]
    fn phrase_is_deterministic() {
        let material = [7u8; 32];
        let a = derive_phrase(&material);
        let b = derive_phrase(&material.to_vec());
        assert_eq!(a, b);
        assert_eq!(a.words().count(), PHRASE_WORDS);
        assert_eq!(derive_phrase(&material), a);
    }

    #[test]
    fn different_material_gives_different_phrase() {
        let a = derive_phrase(b"first transcript");
        let b = derive_phrase(b"second transcript");
        assert_ne!(a, b);
    }
}
