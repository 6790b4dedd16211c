//! Node name generation. If the application doesn't supply a name, a
//! random "adjective_noun" token is generated, with a numeric suffix
//! appended if the combination collides with one already handed out in
//! this process.
use std::sync::Mutex;
use std::sync::OnceLock;

use rand::Rng;
use rand::seq::IndexedRandom;

const ADJECTIVES: &[&str] = &[
    "swift", "quiet", "bold", "eager", "brave", "calm", "clever", "cosmic", "curious", "daring",
    "fuzzy", "gentle", "golden", "happy", "humble", "jolly", "keen", "lively", "lucky", "mellow",
    "nimble", "plucky", "proud", "rapid", "shiny", "silent", "sturdy", "sunny", "tidy", "vivid",
];

const NOUNS: &[&str] = &[
    "falcon", "otter", "badger", "heron", "lynx", "marten", "raven", "sparrow", "beetle", "wombat",
    "gecko", "ibex", "jackal", "kestrel", "mantis", "newt", "osprey", "puffin", "quokka", "swallow",
    "tapir", "urchin", "viper", "weasel", "yak", "zebra", "cicada", "dingo", "egret", "finch",
];

fn seen_names() -> &'static Mutex<Vec<String>> {
    static SEEN: OnceLock<Mutex<Vec<String>>> = OnceLock::new();
    SEEN.get_or_init(|| Mutex::new(Vec::new()))
}

/// Generates a fresh "adjective_noun" token, avoiding collisions with
/// other names generated in the current process.
pub fn generate_name() -> String {
    let mut rng = rand::rng();
    let base = format!(
        "{}_{}",
        ADJECTIVES.choose(&mut rng).unwrap(),
        NOUNS.choose(&mut rng).unwrap()
    );

    let mut seen = seen_names().lock().unwrap_or_else(|e| e.into_inner());
    if !seen.contains(&base) {
        seen.push(base.clone());
        return base;
    }

    loop {
        let suffix: u32 = rng.random_range(1..10_000);
        let candidate = format!("{base}_{suffix}");
        if !seen.contains(&candidate) {
            seen.push(candidate.clone());
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_adjective_noun_shape() {
        let name = generate_name();
        let parts: Vec<&str> = name.split('_').collect();
        assert!(parts.len() >= 2);
        assert!(ADJECTIVES.contains(&parts[0]));
    }

    #[test]
    fn avoids_local_collisions() {
        let mut names = std::collections::HashSet::new();
        for _ in 0..50 {
            let name = generate_name();
            assert!(names.insert(name), "generated a duplicate name locally");
        }
    }
}
