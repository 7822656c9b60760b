//! Demo molecular capability table.
//!
//! Exposes a small `md` namespace of coordinate helpers so console scripts
//! have something domain-shaped to call:
//!
//! | Script name                 | Meaning                                     |
//! |-----------------------------|---------------------------------------------|
//! | `md::distance(a, b)`        | Euclidean distance between two points       |
//! | `md::centroid(points)`      | Geometric center of a point list            |
//! | `md::rmsd(xs, ys)`          | Root-mean-square deviation of two lists     |
//! | `md::ANGSTROM_PER_NM`       | Unit conversion factor (`10.0`)             |
//! | `BOLTZMANN_KJ_PER_MOL_K`    | Boltzmann constant in kJ/(mol K)            |
//!
//! A point is a three-element array of numbers, e.g. `[1.0, 0.0, 2.5]`.

use std::sync::Arc;

use mdscript_core::{CapabilityError, CapabilitySet};
use rhai::{Array, Dynamic, EvalAltResult, Module, FLOAT};

pub const ANGSTROM_PER_NM: FLOAT = 10.0;
pub const BOLTZMANN_KJ_PER_MOL_K: FLOAT = 0.008_314_462_618;

type Point = [FLOAT; 3];
type FnResult<T> = Result<T, Box<EvalAltResult>>;

/// Build the table handed to the script host.
pub fn molecular() -> Result<Arc<CapabilitySet>, CapabilityError> {
    CapabilitySet::builder()
        .module("md", md_module())
        .constant("BOLTZMANN_KJ_PER_MOL_K", BOLTZMANN_KJ_PER_MOL_K)
        .build()
}

fn md_module() -> Module {
    let mut module = Module::new();
    module.set_var("ANGSTROM_PER_NM", ANGSTROM_PER_NM);

    module.set_native_fn("distance", |a: Array, b: Array| -> FnResult<FLOAT> {
        Ok(distance(&point(&a)?, &point(&b)?))
    });

    module.set_native_fn("centroid", |points: Array| -> FnResult<Array> {
        let points = points_of(&points)?;
        if points.is_empty() {
            return Err("centroid of an empty point list".into());
        }
        let n = points.len() as FLOAT;
        let mut center = [0.0; 3];
        for p in &points {
            for (c, v) in center.iter_mut().zip(p) {
                *c += v;
            }
        }
        Ok(center.iter().map(|c| Dynamic::from_float(c / n)).collect())
    });

    module.set_native_fn("rmsd", |xs: Array, ys: Array| -> FnResult<FLOAT> {
        let xs = points_of(&xs)?;
        let ys = points_of(&ys)?;
        if xs.len() != ys.len() {
            return Err(format!(
                "rmsd needs equal point counts, got {} and {}",
                xs.len(),
                ys.len()
            )
            .into());
        }
        if xs.is_empty() {
            return Err("rmsd of empty point lists".into());
        }
        let sum: FLOAT = xs
            .iter()
            .zip(&ys)
            .map(|(a, b)| distance(a, b).powi(2))
            .sum();
        Ok((sum / xs.len() as FLOAT).sqrt())
    });

    module
}

fn distance(a: &Point, b: &Point) -> FLOAT {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).powi(2))
        .sum::<FLOAT>()
        .sqrt()
}

fn number(value: &Dynamic) -> FnResult<FLOAT> {
    value
        .as_float()
        .or_else(|_| value.as_int().map(|i| i as FLOAT))
        .map_err(|type_name| format!("expected a number, got {type_name}").into())
}

fn point(value: &Array) -> FnResult<Point> {
    match value.as_slice() {
        [x, y, z] => Ok([number(x)?, number(y)?, number(z)?]),
        other => Err(format!("a point has 3 coordinates, got {}", other.len()).into()),
    }
}

fn points_of(values: &Array) -> FnResult<Vec<Point>> {
    values
        .iter()
        .map(|value| -> FnResult<Point> {
            let coords = value
                .read_lock::<Array>()
                .ok_or_else(|| format!("expected a point array, got {}", value.type_name()))?;
            point(&coords)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
