use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WormerError};

const WORD_BITS: usize = 32;

/// Bit-encoded control program for one worm. One row per controllable
/// constraint (`2 * (joints - 1)` rows), each row holding `phases` bits
/// packed into 32-bit words; bit `p` set means "constraint extended during
/// phase `p`". Bits at or above `phases` in the last word stay zero.
///
/// Serializes as a plain array of integer rows, so a stored gene round-trips
/// bit-for-bit and can be decoded without knowing the genome parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Gene {
    rows: Vec<Vec<u32>>,
}

pub fn constraint_count(joints: usize) -> usize {
    (joints - 1) * 2
}

fn words_per_row(phases: usize) -> usize {
    phases.div_ceil(WORD_BITS)
}

fn mask_tail(row: &mut [u32], phases: usize) {
    let spare = row.len() * WORD_BITS - phases;
    if spare > 0
        && let Some(last) = row.last_mut()
    {
        *last &= u32::MAX >> spare;
    }
}

impl Gene {
    /// Fills every row with independently random bits.
    pub fn random<R: Rng + ?Sized>(joints: usize, phases: usize, rng: &mut R) -> Self {
        let words = words_per_row(phases);
        let rows = (0..constraint_count(joints))
            .map(|_| {
                let mut row: Vec<u32> = (0..words).map(|_| rng.random()).collect();
                mask_tail(&mut row, phases);
                row
            })
            .collect();
        Self { rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Reads bit `phase` of row `row`. Callers must keep `phase` below the
    /// run's configured phase count; bits beyond it are not meaningful.
    pub fn is_set(&self, row: usize, phase: usize) -> bool {
        self.rows[row][phase / WORD_BITS] & (1 << (phase % WORD_BITS)) != 0
    }

    /// Single-point crossover, drawn independently per row: bits below the
    /// cut come from `a`, bits at or after it from `b`. The cut is bit-exact;
    /// the word straddling it is combined under a mask.
    pub fn crossover<R: Rng + ?Sized>(a: &Gene, b: &Gene, phases: usize, rng: &mut R) -> Gene {
        debug_assert_eq!(a.rows.len(), b.rows.len());
        let rows = a
            .rows
            .iter()
            .zip(&b.rows)
            .map(|(row_a, row_b)| crossover_row(row_a, row_b, rng.random_range(0..phases)))
            .collect();
        Gene { rows }
    }

    /// Flips every bit independently with probability `rate`.
    pub fn mutate<R: Rng + ?Sized>(&mut self, phases: usize, rate: f32, rng: &mut R) {
        for row in &mut self.rows {
            for (word_index, word) in row.iter_mut().enumerate() {
                for bit in 0..WORD_BITS {
                    if word_index * WORD_BITS + bit >= phases {
                        break;
                    }
                    if rng.random::<f32>() < rate {
                        *word ^= 1 << bit;
                    }
                }
            }
        }
    }

    /// Validates a deserialized gene against the run's genome dimensions.
    pub fn check_shape(&self, joints: usize, phases: usize) -> Result<()> {
        let expected_rows = constraint_count(joints);
        if self.rows.len() != expected_rows {
            return Err(WormerError::MalformedGene(format!(
                "expected {expected_rows} rows, found {}",
                self.rows.len()
            )));
        }
        let expected_words = words_per_row(phases);
        for (index, row) in self.rows.iter().enumerate() {
            if row.len() != expected_words {
                return Err(WormerError::MalformedGene(format!(
                    "row {index} holds {} words, expected {expected_words}",
                    row.len()
                )));
            }
        }
        Ok(())
    }
}

fn crossover_row(a: &[u32], b: &[u32], cut: usize) -> Vec<u32> {
    debug_assert_eq!(a.len(), b.len());
    let cut_word = cut / WORD_BITS;
    let cut_mask = (1u32 << (cut % WORD_BITS)) - 1;

    let mut row = Vec::with_capacity(a.len());
    row.extend_from_slice(&a[..cut_word]);
    row.push((a[cut_word] & cut_mask) | (b[cut_word] & !cut_mask));
    row.extend_from_slice(&b[cut_word + 1..]);
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    fn rng() -> ChaCha12Rng {
        ChaCha12Rng::seed_from_u64(7)
    }

    #[test]
    fn random_gene_has_expected_dimensions() {
        for (joints, phases) in [(2, 1), (4, 8), (4, 128), (6, 100)] {
            let gene = Gene::random(joints, phases, &mut rng());
            assert_eq!(gene.row_count(), 2 * (joints - 1));
            assert_eq!(gene.rows[0].len(), phases.div_ceil(32));
            gene.check_shape(joints, phases).unwrap();
        }
    }

    #[test]
    fn bits_beyond_phase_count_stay_clear() {
        let gene = Gene::random(4, 100, &mut rng());
        for row in &gene.rows {
            assert_eq!(row.last().unwrap() >> (100 % 32), 0);
        }
    }

    #[test]
    fn json_round_trip_is_lossless() {
        let gene = Gene::random(4, 128, &mut rng());
        let json = serde_json::to_string(&gene).unwrap();
        let back: Gene = serde_json::from_str(&json).unwrap();
        assert_eq!(back, gene);
    }

    #[test]
    fn deserialization_needs_no_genome_parameters() {
        let back: Gene = serde_json::from_str("[[1,2],[3,4]]").unwrap();
        assert_eq!(back.row_count(), 2);
        assert!(back.is_set(0, 0));
        assert!(!back.is_set(0, 1));
        assert!(back.is_set(1, 34));
    }

    #[test]
    fn crossover_row_is_bit_exact() {
        let phases = 128;
        let a = vec![u32::MAX; 4];
        let b = vec![0u32; 4];
        for cut in [0, 1, 31, 32, 33, 64, 100, 127] {
            let row = crossover_row(&a, &b, cut);
            for phase in 0..phases {
                let bit = row[phase / 32] & (1 << (phase % 32)) != 0;
                assert_eq!(bit, phase < cut, "cut {cut}, phase {phase}");
            }
        }
    }

    #[test]
    fn crossover_row_merges_arbitrary_parents() {
        let a = vec![0xDEAD_BEEF, 0x0123_4567];
        let b = vec![0xCAFE_F00D, 0x89AB_CDEF];
        let cut = 40;
        let row = crossover_row(&a, &b, cut);
        for phase in 0..64 {
            let expected = if phase < cut { &a } else { &b };
            let bit = row[phase / 32] & (1 << (phase % 32)) != 0;
            let want = expected[phase / 32] & (1 << (phase % 32)) != 0;
            assert_eq!(bit, want, "phase {phase}");
        }
    }

    #[test]
    fn zero_mutation_changes_nothing() {
        let original = Gene::random(4, 128, &mut rng());
        let mut mutated = original.clone();
        mutated.mutate(128, 0.0, &mut rng());
        assert_eq!(mutated, original);
    }

    #[test]
    fn full_mutation_flips_every_bit() {
        let original = Gene::random(4, 100, &mut rng());
        let mut mutated = original.clone();
        mutated.mutate(100, 1.0, &mut rng());
        for row in 0..original.row_count() {
            for phase in 0..100 {
                assert_ne!(mutated.is_set(row, phase), original.is_set(row, phase));
            }
        }
        // Flipping only addressable bits keeps the tail clear.
        for row in &mutated.rows {
            assert_eq!(row.last().unwrap() >> (100 % 32), 0);
        }
    }

    #[test]
    fn check_shape_rejects_wrong_dimensions() {
        let gene = Gene::random(4, 128, &mut rng());
        assert!(matches!(
            gene.check_shape(5, 128),
            Err(WormerError::MalformedGene(_))
        ));
        assert!(matches!(
            gene.check_shape(4, 64),
            Err(WormerError::MalformedGene(_))
        ));
    }
}
