//! Toy grammar demo (CKY over a hand-written PCFG).
//!
//! - Tags: `det`, `noun`, `verb` as terminals; `S`, `NP`, `VP` as nonterminals.
//! - Each word gets soft tag scores, the grammar gets log-probabilities.
//! - We report log Z, the best tree, span marginals, the 3 best trees and a few samples.

use ndarray::{Array2, Array3, Array4};
use rand::rngs::StdRng;
use rand::SeedableRng;
use structdp::cky::{self, CkyShape};
use structdp::{from_parts, CkyPotentials, SpanLabels};

const NT: [&str; 3] = ["S", "NP", "VP"];
const T: [&str; 3] = ["det", "noun", "verb"];

fn bracket(spans: &SpanLabels, b: usize, i: usize, j: usize) -> String {
    let label = (0..spans.states).find(|&s| spans.get(b, i, j, s) > 0.5);
    let Some(label) = label else {
        return String::new();
    };
    if i == j {
        return T[label - NT.len()].to_string();
    }
    for k in i..j {
        let left = (0..spans.states).any(|s| spans.get(b, i, k, s) > 0.5);
        let right = (0..spans.states).any(|s| spans.get(b, k + 1, j, s) > 0.5);
        if left && right {
            return format!(
                "({} {} {})",
                NT[label],
                bracket(spans, b, i, k),
                bracket(spans, b, k + 1, j)
            );
        }
    }
    String::new()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let words = ["the", "dog", "saw", "the", "cat"];
    let n = words.len();
    let (nt, t) = (NT.len(), T.len());
    let s = nt + t;
    let shape = CkyShape { batch: 1, n, nt, t };

    // Noisy tagger: "saw" is ambiguous between noun and verb.
    let tag_probs = Array2::from_shape_vec(
        (n, t),
        vec![
            0.9, 0.05, 0.05, //
            0.05, 0.9, 0.05, //
            0.05, 0.4, 0.55, //
            0.9, 0.05, 0.05, //
            0.05, 0.9, 0.05,
        ],
    )?;
    let terms: Array3<f64> = tag_probs.mapv(f64::ln).insert_axis(ndarray::Axis(0));

    let (snt, np, vp) = (0, 1, 2);
    let (det, noun, verb) = (nt, nt + 1, nt + 2);
    let mut rules = Array4::<f64>::from_elem((1, nt, s, s), f64::NEG_INFINITY);
    rules[[0, snt, np, vp]] = 0.0;
    rules[[0, np, det, noun]] = 0.7f64.ln();
    rules[[0, np, np, np]] = 0.3f64.ln();
    rules[[0, vp, verb, np]] = 0.8f64.ln();
    rules[[0, vp, vp, np]] = 0.2f64.ln();
    let mut roots = Array2::<f64>::from_elem((1, nt), f64::NEG_INFINITY);
    roots[[0, snt]] = 0.0;

    let pot = CkyPotentials::new(
        shape,
        terms.into_raw_vec(),
        rules.into_raw_vec(),
        roots.into_raw_vec(),
    )?;

    println!("sentence: {}", words.join(" "));
    println!("log Z = {:.4}", cky::partition(&pot, None)?[0]);
    println!("entropy = {:.4}", cky::entropy(&pot, None)?[0]);

    let (best, parts) = cky::argmax(&pot, None)?;
    let (spans, _) = from_parts(&parts);
    println!("best ({:.4}): {}", best[0], bracket(&spans, 0, 0, n - 1));

    let m = cky::marginals(&pot, None)?;
    let (marg, _) = from_parts(&m);
    println!("span marginals:");
    for w in 1..n {
        for i in 0..n - w {
            for (a, name) in NT.iter().enumerate() {
                let p = marg.get(0, i, i + w, a);
                if p > 1e-3 {
                    println!("  {name:>2} over {:?}: {p:.3}", &words[i..=i + w]);
                }
            }
        }
    }

    let (scores, kbest) = cky::topk(&pot, None, 3)?;
    for (j, parts) in kbest.iter().enumerate() {
        let score = scores.get(0)[j];
        if score == f64::NEG_INFINITY {
            break;
        }
        let (spans, _) = from_parts(parts);
        println!("top {} ({score:.4}): {}", j + 1, bracket(&spans, 0, 0, n - 1));
    }

    let mut rng = StdRng::seed_from_u64(7);
    for parts in cky::sample(&pot, None, 3, &mut rng)? {
        let (spans, _) = from_parts(&parts);
        println!("sample: {}", bracket(&spans, 0, 0, n - 1));
    }
    Ok(())
}
