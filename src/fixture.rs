//! Test input generator.

use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;

use rand::prelude::*;
use rayon::prelude::*;

const WORDS: &[&str] = &[
    "Apple",
    "apple",
    "APPLE",
    "aPPle",
    "Apple!",
    "Apple#",
    "Banana is yellow",
    "Cherry is the best",
    "Something something something",
    "Äpfel",
    "üçé Apple",
    "Zebra",
    "zebra crossing",
    "",
    "Mr. Smith",
];

/// Generates `<number>. <text>` lines, `per_worker` lines by each of `workers` generators.
///
/// Worker `n` draws from its own generator seeded with `seed + n`, so the result does not depend on how
/// workers are scheduled.
pub fn generate(workers: usize, per_worker: usize, seed: u64) -> Vec<String> {
    let chunks: Vec<Vec<String>> = (0..workers)
        .into_par_iter()
        .map(|worker| {
            let mut rng = StdRng::seed_from_u64(seed + worker as u64);
            (0..per_worker).map(|_| generate_line(&mut rng)).collect()
        })
        .collect();

    return chunks.into_iter().flatten().collect();
}

fn generate_line(rng: &mut StdRng) -> String {
    let number: u64 = if rng.gen_ratio(1, 50) {
        rng.gen()
    } else {
        rng.gen_range(0..100_000)
    };

    let word = WORDS.choose(rng).copied().unwrap_or_default();
    if rng.gen_bool(0.5) {
        return format!("{}. {}", number, word);
    }

    let suffix: u32 = rng.gen_range(0..1000);
    return format!("{}. {} {}", number, word, suffix);
}

/// Writes lines to a new file, one per line.
pub fn write(path: &Path, lines: &[String]) -> io::Result<()> {
    let mut writer = io::BufWriter::new(fs::File::create(path)?);
    for line in lines {
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
    }

    return writer.flush();
}

#[cfg(test)]
mod test {
    use super::generate;
    use crate::record::LineRecord;

    #[test]
    fn test_generate_is_deterministic() {
        assert_eq!(generate(3, 100, 1), generate(3, 100, 1));
        assert_ne!(generate(3, 100, 1), generate(3, 100, 2));
    }

    #[test]
    fn test_generated_lines_are_well_formed() {
        let lines = generate(2, 500, 5);

        assert_eq!(lines.len(), 1000);
        for line in &lines {
            assert!(LineRecord::parse(line.as_bytes()).is_ok(), "malformed line: {}", line);
        }
    }
}
