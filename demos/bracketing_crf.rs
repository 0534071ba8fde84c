//! Bracketing CRF demo.
//!
//! Span scores come from a made-up "constituent detector": short spans and spans
//! ending on punctuation are favoured. We decode the best labelled bracketing and
//! print how confident the model is about each span.

use ndarray::Array4;
use structdp::cky_crf::{self, SpanShape};
use structdp::SpanPotentials;

const LABELS: [&str; 2] = ["X", "P"];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let tokens = ["wait", ",", "what", "happened", "?"];
    let n = tokens.len();
    let nt = LABELS.len();
    let shape = SpanShape { batch: 1, n, nt };

    let mut scores = Array4::<f64>::zeros((1, n, n, nt));
    for i in 0..n {
        for j in i..n {
            let width = (j - i) as f64;
            let punct = matches!(tokens[j], "," | "?");
            scores[[0, i, j, 0]] = -0.3 * width;
            let bonus = if punct { 1.0 } else { -1.0 };
            scores[[0, i, j, 1]] = bonus - 0.1 * width;
        }
    }
    let pot = SpanPotentials::new(shape, scores.into_raw_vec())?;

    let lengths = [n];
    println!("log Z = {:.4}", cky_crf::partition(&pot, Some(&lengths))?[0]);
    println!("entropy = {:.4}", cky_crf::entropy(&pot, Some(&lengths))?[0]);

    let (best, parts) = cky_crf::argmax(&pot, Some(&lengths))?;
    println!("best bracketing ({:.4}):", best[0]);
    for w in (0..n).rev() {
        for i in 0..n - w {
            for (a, name) in LABELS.iter().enumerate() {
                if parts.get(0, i, i + w, a) == 1.0 {
                    println!("  {name} {:?}", &tokens[i..=i + w]);
                }
            }
        }
    }

    let m = cky_crf::marginals(&pot, Some(&lengths))?;
    println!("span confidence (any label):");
    for w in 1..n {
        for i in 0..n - w {
            let p: f64 = (0..nt).map(|a| m.get(0, i, i + w, a)).sum();
            println!("  {:?}: {p:.3}", &tokens[i..=i + w]);
        }
    }
    Ok(())
}
