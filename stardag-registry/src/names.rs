//! Server-side build name generation: adjective-noun-number. Names are
//! human-readable handles, not identifiers; uniqueness is not required.

use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brisk", "calm", "clever", "crimson", "daring", "dusty", "eager", "fuzzy",
    "gentle", "golden", "hasty", "icy", "jolly", "keen", "lively", "mellow", "nimble", "polished",
    "quiet", "rapid", "silver", "steady", "swift", "tidy", "vivid", "wandering",
];

const NOUNS: &[&str] = &[
    "aurora", "badger", "beacon", "canyon", "comet", "falcon", "fjord", "glacier", "harbor",
    "heron", "lagoon", "lantern", "meadow", "nebula", "orchard", "osprey", "otter", "pebble",
    "prairie", "quarry", "raven", "reef", "sparrow", "summit", "thicket", "tundra", "walrus",
    "willow",
];

pub fn generate_build_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
    let number: u16 = rng.gen_range(0..10_000);
    format!("{adjective}-{noun}-{number}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_three_part_names() {
        for _ in 0..32 {
            let name = generate_build_name();
            let parts: Vec<&str> = name.split('-').collect();
            assert_eq!(parts.len(), 3, "{name}");
            assert!(ADJECTIVES.contains(&parts[0]));
            assert!(NOUNS.contains(&parts[1]));
            assert!(parts[2].parse::<u16>().unwrap() < 10_000);
        }
    }
}
