//! Dataset loading and batch collation.
//!
//! The external BPE tool produces pre-tokenized id files: `{split}.src` and
//! `{split}.tgt` hold one whitespace-separated id sequence per line (bos/eos
//! already attached by the tokenizer), and an optional `{split}.loc` holds one
//! integer location label per line. With location conditioning enabled every
//! source sequence is prefixed with the token `base_vocab + label`, mirroring
//! the vocabulary extension applied at model construction.

use std::path::Path;

use candle_core::{Device, Result as CandleResult, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom};

use crate::config::NmtError;

#[derive(Debug, Clone)]
pub struct Example {
    pub source: Vec<u32>,
    pub target: Vec<u32>,
    pub location: u32,
}

#[derive(Debug)]
pub struct NmtDataset {
    examples: Vec<Example>,
    num_locations: usize,
}

impl NmtDataset {
    /// Load one split. `base_vocab` is the tokenizer vocabulary size; ids at
    /// or above it (and sequences longer than `max_len`) are fatal, matching
    /// the fail-fast posture for shape mismatches.
    pub fn load(
        data_dir: impl AsRef<Path>,
        split: &str,
        use_loc: bool,
        base_vocab: usize,
        max_len: usize,
    ) -> Result<Self, NmtError> {
        let dir = data_dir.as_ref();
        let sources = read_id_file(&dir.join(format!("{split}.src")))?;
        let targets = read_id_file(&dir.join(format!("{split}.tgt")))?;

        if sources.len() != targets.len() {
            return Err(NmtError::initialization(format!(
                "{split}: {} source lines but {} target lines",
                sources.len(),
                targets.len()
            )));
        }
        if sources.is_empty() {
            return Err(NmtError::initialization(format!(
                "{split}: dataset is empty"
            )));
        }

        let locations = if use_loc {
            let path = dir.join(format!("{split}.loc"));
            let labels = read_label_file(&path)?;
            if labels.len() != sources.len() {
                return Err(NmtError::initialization(format!(
                    "{split}: {} location labels for {} examples",
                    labels.len(),
                    sources.len()
                )));
            }
            Some(labels)
        } else {
            None
        };

        let mut examples = Vec::with_capacity(sources.len());
        let mut max_label = None::<u32>;
        for (index, (mut source, target)) in sources.into_iter().zip(targets).enumerate() {
            let location = locations.as_ref().map(|labels| labels[index]).unwrap_or(0);
            if use_loc {
                max_label = Some(max_label.map_or(location, |m| m.max(location)));
                // Location token occupies the first source position.
                source.insert(0, (base_vocab + location as usize) as u32);
            }

            validate_ids(split, index, &source, base_vocab, use_loc, max_len)?;
            validate_target(split, index, &target, base_vocab, max_len)?;

            examples.push(Example {
                source,
                target,
                location,
            });
        }

        let num_locations = match (use_loc, max_label) {
            (true, Some(max_label)) => max_label as usize + 1,
            (true, None) => {
                return Err(NmtError::initialization(format!(
                    "{split}: location conditioning requested but no labels present"
                )))
            }
            (false, _) => 0,
        };

        Ok(NmtDataset {
            examples,
            num_locations,
        })
    }

    pub fn from_examples(examples: Vec<Example>, num_locations: usize) -> Self {
        NmtDataset {
            examples,
            num_locations,
        }
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Number of distinct location labels, as the count of label values in
    /// `0..=max_label`. Zero when location conditioning is off.
    pub fn num_locations(&self) -> usize {
        self.num_locations
    }

    pub fn num_batches(&self, batch_size: usize) -> usize {
        self.examples.len().div_ceil(batch_size)
    }

    /// Iterate the split in batches. Training shuffles the example order each
    /// epoch through the caller's RNG; validation passes `None` and consumes
    /// the split sequentially.
    pub fn batches<'a>(
        &'a self,
        batch_size: usize,
        shuffle: Option<&mut StdRng>,
        pad_id: u32,
        device: &'a Device,
    ) -> BatchIter<'a> {
        let mut order: Vec<usize> = (0..self.examples.len()).collect();
        if let Some(rng) = shuffle {
            order.shuffle(rng);
        }
        BatchIter {
            dataset: self,
            order,
            batch_size,
            cursor: 0,
            pad_id,
            device,
        }
    }
}

/// Uniformly padded batch as consumed by the training step.
#[derive(Debug)]
pub struct Batch {
    /// `[batch, src_len]` u32 ids, pad-suffixed.
    pub source: Tensor,
    /// `[batch, tgt_len]` u32 ids, pad-suffixed.
    pub target: Tensor,
    /// `[batch]` u32 location labels.
    pub label: Tensor,
    pub size: usize,
}

impl Batch {
    pub fn collate(examples: &[&Example], pad_id: u32, device: &Device) -> CandleResult<Batch> {
        let size = examples.len();
        let src_len = examples.iter().map(|e| e.source.len()).max().unwrap_or(0);
        let tgt_len = examples.iter().map(|e| e.target.len()).max().unwrap_or(0);

        let mut src = vec![pad_id; size * src_len];
        let mut tgt = vec![pad_id; size * tgt_len];
        let mut labels = Vec::with_capacity(size);
        for (row, example) in examples.iter().enumerate() {
            src[row * src_len..row * src_len + example.source.len()]
                .copy_from_slice(&example.source);
            tgt[row * tgt_len..row * tgt_len + example.target.len()]
                .copy_from_slice(&example.target);
            labels.push(example.location);
        }

        Ok(Batch {
            source: Tensor::from_vec(src, (size, src_len), device)?,
            target: Tensor::from_vec(tgt, (size, tgt_len), device)?,
            label: Tensor::from_vec(labels, (size,), device)?,
            size,
        })
    }

    pub fn to_device(&self, device: &Device) -> CandleResult<Batch> {
        Ok(Batch {
            source: self.source.to_device(device)?,
            target: self.target.to_device(device)?,
            label: self.label.to_device(device)?,
            size: self.size,
        })
    }
}

pub struct BatchIter<'a> {
    dataset: &'a NmtDataset,
    order: Vec<usize>,
    batch_size: usize,
    cursor: usize,
    pad_id: u32,
    device: &'a Device,
}

impl Iterator for BatchIter<'_> {
    type Item = CandleResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let examples: Vec<&Example> = self.order[self.cursor..end]
            .iter()
            .map(|&i| &self.dataset.examples[i])
            .collect();
        self.cursor = end;
        Some(Batch::collate(&examples, self.pad_id, self.device))
    }
}

fn read_id_file(path: &Path) -> Result<Vec<Vec<u32>>, NmtError> {
    let contents = std::fs::read_to_string(path).map_err(|err| {
        NmtError::initialization(format!("failed to read {}: {}", path.display(), err))
    })?;
    contents
        .lines()
        .enumerate()
        .map(|(line_no, line)| {
            line.split_whitespace()
                .map(|token| {
                    token.parse::<u32>().map_err(|_| {
                        NmtError::initialization(format!(
                            "{}:{}: invalid token id '{}'",
                            path.display(),
                            line_no + 1,
                            token
                        ))
                    })
                })
                .collect()
        })
        .collect()
}

fn read_label_file(path: &Path) -> Result<Vec<u32>, NmtError> {
    let contents = std::fs::read_to_string(path).map_err(|err| {
        NmtError::initialization(format!(
            "location conditioning requested but {} is unreadable: {}",
            path.display(),
            err
        ))
    })?;
    contents
        .lines()
        .enumerate()
        .map(|(line_no, line)| {
            line.trim().parse::<u32>().map_err(|_| {
                NmtError::initialization(format!(
                    "{}:{}: invalid location label '{}'",
                    path.display(),
                    line_no + 1,
                    line.trim()
                ))
            })
        })
        .collect()
}

fn validate_ids(
    split: &str,
    index: usize,
    source: &[u32],
    base_vocab: usize,
    use_loc: bool,
    max_len: usize,
) -> Result<(), NmtError> {
    if source.len() > max_len {
        return Err(NmtError::initialization(format!(
            "{split} example {}: source length {} exceeds max_len {}",
            index,
            source.len(),
            max_len
        )));
    }
    // Skip the prefixed location token, which legitimately exceeds base_vocab.
    let body = if use_loc { &source[1..] } else { source };
    for &id in body {
        if id as usize >= base_vocab {
            return Err(NmtError::initialization(format!(
                "{split} example {}: source id {} outside vocabulary of size {}",
                index, id, base_vocab
            )));
        }
    }
    Ok(())
}

fn validate_target(
    split: &str,
    index: usize,
    target: &[u32],
    base_vocab: usize,
    max_len: usize,
) -> Result<(), NmtError> {
    if target.len() > max_len {
        return Err(NmtError::initialization(format!(
            "{split} example {}: target length {} exceeds max_len {}",
            index,
            target.len(),
            max_len
        )));
    }
    if target.len() < 2 {
        return Err(NmtError::initialization(format!(
            "{split} example {}: target needs at least bos and one token",
            index
        )));
    }
    for &id in target {
        if id as usize >= base_vocab {
            return Err(NmtError::initialization(format!(
                "{split} example {}: target id {} outside vocabulary of size {}",
                index, id, base_vocab
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::fs;

    fn write_split(dir: &Path, split: &str, src: &str, tgt: &str, loc: Option<&str>) {
        fs::write(dir.join(format!("{split}.src")), src).unwrap();
        fs::write(dir.join(format!("{split}.tgt")), tgt).unwrap();
        if let Some(loc) = loc {
            fs::write(dir.join(format!("{split}.loc")), loc).unwrap();
        }
    }

    #[test]
    fn collation_pads_to_batch_maximum() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), "train", "5 12 7\n4 9\n", "1 3 9 2\n1 8 2\n", None);

        let dataset = NmtDataset::load(dir.path(), "train", false, 100, 32).unwrap();
        assert_eq!(dataset.len(), 2);

        let device = Device::Cpu;
        let batches: Vec<_> = dataset
            .batches(2, None, 0, &device)
            .collect::<CandleResult<_>>()
            .unwrap();
        assert_eq!(batches.len(), 1);

        let src = batches[0].source.to_vec2::<u32>().unwrap();
        assert_eq!(src, vec![vec![5, 12, 7], vec![4, 9, 0]]);
        let tgt = batches[0].target.to_vec2::<u32>().unwrap();
        assert_eq!(tgt, vec![vec![1, 3, 9, 2], vec![1, 8, 2, 0]]);
    }

    #[test]
    fn location_labels_prefix_the_source() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), "train", "5 12\n4 9\n", "1 3 2\n1 8 2\n", Some("0\n2\n"));

        let dataset = NmtDataset::load(dir.path(), "train", true, 100, 32).unwrap();
        assert_eq!(dataset.num_locations(), 3);

        let device = Device::Cpu;
        let batch = dataset
            .batches(2, None, 0, &device)
            .next()
            .unwrap()
            .unwrap();
        let src = batch.source.to_vec2::<u32>().unwrap();
        assert_eq!(src[0][0], 100);
        assert_eq!(src[1][0], 102);
    }

    #[test]
    fn missing_location_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), "train", "5 12\n", "1 3 2\n", None);
        assert!(NmtDataset::load(dir.path(), "train", true, 100, 32).is_err());
    }

    #[test]
    fn overlong_sequence_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), "train", "1 2 3 4 5 6\n", "1 3 2\n", None);
        assert!(NmtDataset::load(dir.path(), "train", false, 100, 5).is_err());
    }

    #[test]
    fn out_of_vocabulary_id_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), "train", "5 200\n", "1 3 2\n", None);
        assert!(NmtDataset::load(dir.path(), "train", false, 100, 32).is_err());
    }

    #[test]
    fn shuffled_iteration_covers_every_example_once() {
        let examples = (0..10)
            .map(|i| Example {
                source: vec![i + 1, i + 2],
                target: vec![1, i + 1, 2],
                location: 0,
            })
            .collect();
        let dataset = NmtDataset::from_examples(examples, 0);

        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(17);
        let mut seen = Vec::new();
        for batch in dataset.batches(3, Some(&mut rng), 0, &device) {
            let batch = batch.unwrap();
            for row in batch.source.to_vec2::<u32>().unwrap() {
                seen.push(row[0]);
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, (1..=10).collect::<Vec<u32>>());
    }
}
