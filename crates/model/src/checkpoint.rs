//! llama2-format checkpoint loading
//!
//! Layout (little-endian):
//!
//! ```text
//! header: dim, hidden_dim, n_layers, n_heads, n_kv_heads, vocab_size, seq_len  (7 × i32)
//! token_embedding   [vocab_size, dim]
//! rms_att           [n_layers, dim]
//! wq                [n_layers, dim, dim]
//! wk                [n_layers, kv_dim, dim]
//! wv                [n_layers, kv_dim, dim]
//! wo                [n_layers, dim, dim]
//! rms_ffn           [n_layers, dim]
//! w1                [n_layers, hidden_dim, dim]
//! w2                [n_layers, dim, hidden_dim]
//! w3                [n_layers, hidden_dim, dim]
//! rms_final         [dim]
//! freq_cis_real     [seq_len, head_size / 2]   (skipped)
//! freq_cis_imag     [seq_len, head_size / 2]   (skipped)
//! wcls              [vocab_size, dim]          (only when vocab_size < 0)
//! ```
//!
//! A negative `vocab_size` in the header marks an untied classifier.

use std::fs::File;
use std::io::{BufWriter, Cursor, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::Mmap;

use crate::config::ModelConfig;
use crate::error::{ModelError, Result};
use crate::weights::WeightSet;

/// Header size in bytes
pub const CHECKPOINT_HEADER_BYTES: usize = 7 * 4;

/// Load a checkpoint file into owned weights
pub fn load_checkpoint(path: impl AsRef<Path>) -> Result<WeightSet> {
    let path = path.as_ref();
    let file = File::open(path)?;
    // SAFETY: the mapping is read-only and dropped before returning; all data
    // is copied into owned buffers.
    let mmap = unsafe { Mmap::map(&file)? };

    if mmap.len() < CHECKPOINT_HEADER_BYTES {
        return Err(ModelError::Checkpoint(format!(
            "{}: file too small for header ({} bytes)",
            path.display(),
            mmap.len()
        )));
    }

    let mut header = Cursor::new(&mmap[..CHECKPOINT_HEADER_BYTES]);
    let mut fields = [0i32; 7];
    header.read_i32_into::<LittleEndian>(&mut fields)?;

    let [dim, hidden_dim, n_layers, n_heads, n_kv_heads, vocab_size, seq_len] = fields;
    for (name, value) in [
        ("dim", dim),
        ("hidden_dim", hidden_dim),
        ("n_layers", n_layers),
        ("n_heads", n_heads),
        ("n_kv_heads", n_kv_heads),
        ("seq_len", seq_len),
    ] {
        if value <= 0 {
            return Err(ModelError::Checkpoint(format!("invalid {} in header: {}", name, value)));
        }
    }
    if vocab_size == 0 {
        return Err(ModelError::Checkpoint("invalid vocab_size in header: 0".to_string()));
    }

    let shared_classifier = vocab_size > 0;
    let config = ModelConfig {
        dim: dim as usize,
        hidden_dim: hidden_dim as usize,
        n_layers: n_layers as usize,
        n_heads: n_heads as usize,
        n_kv_heads: n_kv_heads as usize,
        vocab_size: vocab_size.unsigned_abs() as usize,
        seq_len: seq_len as usize,
    };
    config.validate()?;

    let mut reader = TensorReader {
        data: &mmap[CHECKPOINT_HEADER_BYTES..],
        offset: 0,
    };

    let c = &config;
    let (d, h, kv, l) = (c.dim, c.hidden_dim, c.kv_dim(), c.n_layers);

    let token_embedding = reader.read("token_embedding", c.vocab_size * d)?;
    let rms_att = reader.read("rms_att", l * d)?;
    let wq = reader.read("wq", l * d * d)?;
    let wk = reader.read("wk", l * kv * d)?;
    let wv = reader.read("wv", l * kv * d)?;
    let wo = reader.read("wo", l * d * d)?;
    let rms_ffn = reader.read("rms_ffn", l * d)?;
    let w1 = reader.read("w1", l * h * d)?;
    let w2 = reader.read("w2", l * d * h)?;
    let w3 = reader.read("w3", l * h * d)?;
    let rms_final = reader.read("rms_final", d)?;
    reader.skip("freq_cis", c.seq_len * c.head_size())?;
    let wcls = if shared_classifier {
        None
    } else {
        Some(reader.read("wcls", c.vocab_size * d)?)
    };

    let weights = WeightSet {
        config,
        token_embedding,
        rms_att,
        rms_ffn,
        wq,
        wk,
        wv,
        wo,
        w1,
        w2,
        w3,
        rms_final,
        wcls,
    };
    weights.validate()?;

    tracing::info!(
        path = %path.display(),
        dim = config.dim,
        layers = config.n_layers,
        heads = config.n_heads,
        kv_heads = config.n_kv_heads,
        vocab = config.vocab_size,
        seq_len = config.seq_len,
        shared_classifier,
        parameters = weights.num_parameters(),
        "checkpoint loaded"
    );

    Ok(weights)
}

/// Write weights in checkpoint format
pub fn write_checkpoint(path: impl AsRef<Path>, weights: &WeightSet) -> Result<()> {
    weights.validate()?;
    let c = &weights.config;
    let mut out = BufWriter::new(File::create(path.as_ref())?);

    let vocab = c.vocab_size as i32;
    let header = [
        c.dim as i32,
        c.hidden_dim as i32,
        c.n_layers as i32,
        c.n_heads as i32,
        c.n_kv_heads as i32,
        if weights.shared_classifier() { vocab } else { -vocab },
        c.seq_len as i32,
    ];
    for field in header {
        out.write_i32::<LittleEndian>(field)?;
    }

    let rope_tables = vec![0.0f32; c.seq_len * c.head_size()];
    let tensors: [&[f32]; 13] = [
        &weights.token_embedding,
        &weights.rms_att,
        &weights.wq,
        &weights.wk,
        &weights.wv,
        &weights.wo,
        &weights.rms_ffn,
        &weights.w1,
        &weights.w2,
        &weights.w3,
        &weights.rms_final,
        &rope_tables,
        weights.wcls.as_deref().unwrap_or(&[]),
    ];
    for tensor in tensors {
        for &v in tensor {
            out.write_f32::<LittleEndian>(v)?;
        }
    }
    out.flush()?;
    Ok(())
}

/// Sequential f32 reader over the mapped tensor section
struct TensorReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl TensorReader<'_> {
    fn take(&mut self, name: &str, count: usize) -> Result<&[u8]> {
        let bytes = count * 4;
        let end = self.offset + bytes;
        if end > self.data.len() {
            return Err(ModelError::Checkpoint(format!(
                "truncated checkpoint: {} needs {} bytes at offset {}, {} available",
                name,
                bytes,
                self.offset + CHECKPOINT_HEADER_BYTES,
                self.data.len() - self.offset
            )));
        }
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn read(&mut self, name: &str, count: usize) -> Result<Vec<f32>> {
        let bytes = self.take(name, count)?;
        let mut values = vec![0.0f32; count];
        Cursor::new(bytes).read_f32_into::<LittleEndian>(&mut values)?;
        Ok(values)
    }

    fn skip(&mut self, name: &str, count: usize) -> Result<()> {
        self.take(name, count).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("pimlm-{}-{}.bin", tag, std::process::id()))
    }

    fn config() -> ModelConfig {
        ModelConfig {
            dim: 8,
            hidden_dim: 12,
            n_layers: 2,
            n_heads: 2,
            n_kv_heads: 1,
            vocab_size: 10,
            seq_len: 6,
        }
    }

    #[test]
    fn test_untied_classifier_checkpoint() {
        let weights = WeightSet::random(config(), 11).unwrap();
        let path = temp_path("untied");
        write_checkpoint(&path, &weights).unwrap();

        let loaded = load_checkpoint(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.config, weights.config);
        assert!(!loaded.shared_classifier());
        assert_eq!(loaded.wk, weights.wk);
        assert_eq!(loaded.classifier(), weights.classifier());
    }

    #[test]
    fn test_tied_classifier_checkpoint() {
        let mut weights = WeightSet::random(config(), 12).unwrap();
        weights.wcls = None;
        let path = temp_path("tied");
        write_checkpoint(&path, &weights).unwrap();

        let loaded = load_checkpoint(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert!(loaded.shared_classifier());
        assert_eq!(loaded.rms_final, weights.rms_final);
    }

    #[test]
    fn test_truncated_checkpoint() {
        let weights = WeightSet::random(config(), 13).unwrap();
        let path = temp_path("truncated");
        write_checkpoint(&path, &weights).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        let result = load_checkpoint(&path);
        std::fs::remove_file(&path).ok();

        assert!(matches!(result, Err(ModelError::Checkpoint(_))));
    }
}
