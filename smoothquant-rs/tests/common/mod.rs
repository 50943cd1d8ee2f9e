//! Shared fixtures: a tiny OPT checkpoint written to disk.

#![allow(dead_code)]

use std::fs;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use smoothquant_rs::{OptConfig, OptModel};

/// Letters `a..z` map to IDs 3..=28.
pub fn letter_vocab() -> String {
    let mut entries = vec![r#""<pad>": 1"#.to_string(), r#""</s>": 2"#.to_string()];
    for (i, c) in ('a'..='z').enumerate() {
        entries.push(format!(r#""{c}": {}"#, i + 3));
    }
    format!("{{{}}}", entries.join(", "))
}

/// Write config.json, model.safetensors, vocab.json and merges.txt for a
/// randomly initialized tiny model. Returns the model as written.
pub fn write_tiny_checkpoint(dir: &Path) -> OptModel {
    let device = Device::Cpu;
    let config = OptConfig::tiny();

    let var_map = VarMap::new();
    let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
    let model = OptModel::from_varbuilder(&config, vb).unwrap();
    var_map.save(dir.join("model.safetensors")).unwrap();

    fs::write(dir.join("config.json"), serde_json::to_string_pretty(&config).unwrap()).unwrap();
    fs::write(dir.join("vocab.json"), letter_vocab()).unwrap();
    fs::write(dir.join("merges.txt"), "#version: 0.2\n").unwrap();
    model
}

/// JSONL file of short space-free lowercase texts.
pub fn write_letter_dataset(path: &Path, count: usize) {
    let letters: Vec<char> = ('a'..='z').collect();
    let lines: Vec<String> = (0..count)
        .map(|i| {
            let text: String = (0..(3 + i % 7))
                .map(|j| letters[(i * 7 + j * 3) % letters.len()])
                .collect();
            format!(r#"{{"text": "{text}"}}"#)
        })
        .collect();
    fs::write(path, lines.join("\n")).unwrap();
}

/// Scale channels of every norm output by `factor` and divide the matching
/// consumer columns, leaving the float function unchanged while creating
/// activation outliers.
pub fn inject_outliers(model: &mut OptModel, channels: &[usize], factor: f32) {
    let hidden = model.config().hidden_size;
    let mut mask = vec![1f32; hidden];
    for &c in channels {
        mask[c] = factor;
    }
    let mask = Tensor::new(mask.as_slice(), model.device()).unwrap();

    for block in model.blocks_mut() {
        let w = block.attn_norm.weight().broadcast_mul(&mask).unwrap();
        let b = block.attn_norm.bias().broadcast_mul(&mask).unwrap();
        block.attn_norm.set_parameters(w, b).unwrap();
        for proj in [block.q_proj, block.k_proj, block.v_proj] {
            let w = proj.weight().broadcast_div(&mask).unwrap();
            let bias = proj.bias().cloned();
            proj.set_parameters(w, bias).unwrap();
        }

        let w = block.ffn_norm.weight().broadcast_mul(&mask).unwrap();
        let b = block.ffn_norm.bias().broadcast_mul(&mask).unwrap();
        block.ffn_norm.set_parameters(w, b).unwrap();
        let w = block.fc1.weight().broadcast_div(&mask).unwrap();
        let bias = block.fc1.bias().cloned();
        block.fc1.set_parameters(w, bias).unwrap();
    }
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap()
}

pub fn mean_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b).unwrap().abs().unwrap().mean_all().unwrap().to_scalar::<f32>().unwrap()
}
