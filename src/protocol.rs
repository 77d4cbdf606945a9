use serde::{Deserialize, Serialize};

use crate::config::SimulationOptions;
use crate::gene::Gene;

/// Parent-to-child coordination messages. The `type` discriminator and
/// payload names are the crate's wire contract; every message crosses exactly
/// one parent-child channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DownMessage {
    /// Assign a partition size and configuration to this subtree.
    Setup {
        count: usize,
        options: SimulationOptions,
        id: String,
    },
    /// Replace the subtree's population genes, positionally.
    #[serde(rename = "gene")]
    Genes { genes: Vec<Gene> },
    Start,
    Pause,
    Resume,
    Terminate,
}

/// Child-to-parent messages. Lifecycle acknowledgements bubble up only after
/// a branch's all-children barrier; `generationEnd` doubles as the pause
/// acknowledgement when a pause lands on a natural generation boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UpMessage {
    SetupDone,
    Started,
    Paused,
    Resumed,
    Terminated,
    Progress { progress: f32 },
    GenerationEnd(GenerationResult),
}

/// One subtree's generation outcome, sorted descending by fitness with
/// `genes[i]` and `fitness[i]` paired.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    pub genes: Vec<Gene>,
    pub fitness: Vec<f32>,
    pub average: f32,
}

impl GenerationResult {
    pub fn len(&self) -> usize {
        self.genes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }
}

/// Splits `count` into `children` near-equal contiguous shares, remainder
/// assigned to the first shares.
pub fn partition_counts(count: usize, children: usize) -> Vec<usize> {
    (0..children)
        .map(|index| count / children + usize::from(count % children > index))
        .collect()
}

/// K-way merge of per-child results that are already sorted descending:
/// repeatedly takes the maximum across all remaining heads, preferring the
/// lowest child index on ties. The combined average weights each child's
/// average by its size.
pub fn merge_results(parts: &[GenerationResult]) -> GenerationResult {
    let total: usize = parts.iter().map(GenerationResult::len).sum();
    let mut heads = vec![0usize; parts.len()];
    let mut genes = Vec::with_capacity(total);
    let mut fitness = Vec::with_capacity(total);

    for _ in 0..total {
        let mut best: Option<usize> = None;
        for (index, part) in parts.iter().enumerate() {
            if heads[index] >= part.len() {
                continue;
            }
            let candidate = part.fitness[heads[index]];
            if best.is_none_or(|current| candidate > parts[current].fitness[heads[current]]) {
                best = Some(index);
            }
        }
        let winner = best.expect("head available while entries remain");
        genes.push(parts[winner].genes[heads[winner]].clone());
        fitness.push(parts[winner].fitness[heads[winner]]);
        heads[winner] += 1;
    }

    let average = if total == 0 {
        0.0
    } else {
        parts
            .iter()
            .map(|part| part.average * part.len() as f32)
            .sum::<f32>()
            / total as f32
    };

    GenerationResult {
        genes,
        fitness,
        average,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    fn result(seed: u64, fitness: Vec<f32>) -> GenerationResult {
        let mut rng = ChaCha12Rng::seed_from_u64(seed);
        let average = fitness.iter().sum::<f32>() / fitness.len().max(1) as f32;
        GenerationResult {
            genes: fitness
                .iter()
                .map(|_| Gene::random(4, 8, &mut rng))
                .collect(),
            fitness,
            average,
        }
    }

    #[test]
    fn partitions_remainder_to_leading_children() {
        assert_eq!(partition_counts(17, 4), vec![5, 4, 4, 4]);
        assert_eq!(partition_counts(8, 2), vec![4, 4]);
        assert_eq!(partition_counts(3, 2), vec![2, 1]);
        assert_eq!(partition_counts(1, 4), vec![1, 0, 0, 0]);
    }

    #[test]
    fn merge_produces_single_sorted_result() {
        let parts = [
            result(1, vec![9.0, 7.0]),
            result(2, vec![8.0, 3.0]),
            result(3, vec![10.0, 1.0]),
            result(4, vec![6.0, 2.0]),
        ];
        let merged = merge_results(&parts);
        assert_eq!(merged.fitness, vec![10.0, 9.0, 8.0, 7.0, 6.0, 3.0, 2.0, 1.0]);
        assert_eq!(merged.len(), 8);
        assert!((merged.average - 46.0 / 8.0).abs() < 1e-6);
    }

    #[test]
    fn merge_keeps_gene_fitness_pairing() {
        let parts = [result(1, vec![5.0, 1.0]), result(2, vec![4.0, 2.0])];
        let merged = merge_results(&parts);
        assert_eq!(merged.genes[0], parts[0].genes[0]);
        assert_eq!(merged.genes[1], parts[1].genes[0]);
        assert_eq!(merged.genes[2], parts[1].genes[1]);
        assert_eq!(merged.genes[3], parts[0].genes[1]);
    }

    #[test]
    fn merge_breaks_ties_by_child_index() {
        let parts = [result(1, vec![4.0]), result(2, vec![4.0]), result(3, vec![4.0])];
        let merged = merge_results(&parts);
        assert_eq!(merged.genes[0], parts[0].genes[0]);
        assert_eq!(merged.genes[1], parts[1].genes[0]);
        assert_eq!(merged.genes[2], parts[2].genes[0]);
    }

    #[test]
    fn merge_of_uneven_sizes_is_a_permutation() {
        let parts = [result(1, vec![3.0, 2.0, 1.0]), result(2, vec![2.5]), result(3, vec![])];
        let merged = merge_results(&parts);
        assert_eq!(merged.fitness, vec![3.0, 2.5, 2.0, 1.0]);
        let weighted = (6.0 + 2.5) / 4.0;
        assert!((merged.average - weighted).abs() < 1e-6);
    }

    #[test]
    fn wire_shape_matches_contract() {
        let down = DownMessage::Genes { genes: Vec::new() };
        assert_eq!(
            serde_json::to_value(&down).unwrap(),
            serde_json::json!({ "type": "gene", "genes": [] })
        );

        let up = UpMessage::GenerationEnd(GenerationResult {
            genes: Vec::new(),
            fitness: Vec::new(),
            average: 0.0,
        });
        let value = serde_json::to_value(&up).unwrap();
        assert_eq!(value["type"], "generationEnd");
        assert!(value["fitness"].is_array());

        let round: UpMessage = serde_json::from_value(value).unwrap();
        assert!(matches!(round, UpMessage::GenerationEnd(_)));

        assert_eq!(
            serde_json::to_value(UpMessage::SetupDone).unwrap(),
            serde_json::json!({ "type": "setupDone" })
        );
    }
}
