//! The interpreted program agrees with the reference evaluator.
//!
//! Each case is evaluated three ways: by `interpreter::evaluate` over plain
//! specs, by the optimized program on the fast backend, and by the
//! unoptimized program on the simple backend. All three must agree.

use proptest::prelude::*;
use tenseval::interpreter::evaluate;
use tenseval::value::Label;
use tenseval::{
    Aggr, Backend, BinaryOp, EngineConfig, Function, NoConstants, Node, TensorSpec, UnaryOp, Value, ValueType,
    eval_once, value_from_spec,
};

const LABELS: [&str; 5] = ["a", "b", "c", "d", "e"];

/// A spec of type `ty` with one subspace per label (or a single subspace when
/// there is no mapped dimension), taking cell values from `values` in order.
fn fill(ty: &str, labels: &[&str], values: &[f64]) -> TensorSpec {
    let ty = ValueType::from_spec(ty);
    let mut spec = TensorSpec::new(ty.clone());
    let mapped: Vec<String> = ty.mapped_dimensions().iter().map(|d| d.name.clone()).collect();
    let indexed: Vec<(String, u32)> = ty.indexed_dimensions().iter().map(|d| (d.name.clone(), d.size)).collect();
    let subspace: u32 = indexed.iter().map(|(_, s)| s).product();
    let subspaces: Vec<Option<&str>> = if mapped.is_empty() { vec![None] } else { labels.iter().map(|l| Some(*l)).collect() };
    let mut next = values.iter().copied().cycle();
    for label in subspaces {
        for flat in 0..subspace {
            let mut rest = flat;
            let mut address: Vec<(&str, Label)> = Vec::new();
            for (name, size) in indexed.iter().rev() {
                address.push((name.as_str(), Label::Indexed((rest % size) as usize)));
                rest /= size;
            }
            if let (Some(dim), Some(label)) = (mapped.first(), label) {
                address.push((dim.as_str(), Label::Mapped(label.to_string())));
            }
            spec.add_cell(&address, next.next().unwrap_or(0.0));
        }
    }
    spec
}

fn check(root: Node, params: &[TensorSpec]) -> Result<(), TestCaseError> {
    let names: Vec<&str> = ["p", "q", "r"][..params.len()].to_vec();
    let function = Function::new(&names, root);
    let expected = evaluate(&function, params, &NoConstants);
    let configs = [EngineConfig::default(), EngineConfig { optimize: false, backend: Backend::Simple }];
    for config in configs {
        let factory = config.factory();
        let values: Vec<Box<dyn Value>> = params.iter().map(|p| value_from_spec(p, &*factory)).collect();
        let refs: Vec<&dyn Value> = values.iter().map(|v| v.as_ref()).collect();
        let actual = eval_once(&function, &refs, &NoConstants, &config).map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert!(actual.approx_eq(&expected, 1e-9), "{:?}\nactual:   {actual}\nexpected: {expected}", config);
    }
    Ok(())
}

fn mul_join() -> Node {
    Node::join(Node::Symbol(0), Node::Symbol(1), BinaryOp::Mul)
}

// Quarters are exact in every cell type, so float operands need no rounding slack.
fn cells() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec((-16i32..16).prop_map(|v| f64::from(v) / 4.0), 24)
}

// Non-finite and signed-zero cells mixed in with ordinary quarters.
fn special_cells() -> impl Strategy<Value = Vec<f64>> {
    let special = prop::sample::select(vec![f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 0.0, -0.0]);
    let quarter = (-16i32..16).prop_map(|v| f64::from(v) / 4.0);
    prop::collection::vec(prop_oneof![special, quarter], 24)
}

fn labels() -> impl Strategy<Value = Vec<&'static str>> {
    prop::sample::subsequence(LABELS.to_vec(), 1..=LABELS.len())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    // ─── Dense kernels ───

    #[test]
    fn dot_product(a in cells(), b in cells()) {
        let root = Node::reduce(mul_join(), Aggr::Sum, &[]);
        check(root, &[fill("tensor(x[5])", &[], &a), fill("tensor<float>(x[5])", &[], &b)])?;
    }

    #[test]
    fn vector_matrix_product(a in cells(), b in cells()) {
        let root = Node::reduce(mul_join(), Aggr::Sum, &["y"]);
        check(root, &[fill("tensor(y[3])", &[], &a), fill("tensor(x[2],y[3])", &[], &b)])?;
    }

    #[test]
    fn matrix_product(a in cells(), b in cells()) {
        let root = Node::reduce(mul_join(), Aggr::Sum, &["k"]);
        check(root, &[fill("tensor(k[3],z[2])", &[], &a), fill("tensor(a[4],k[3])", &[], &b)])?;
    }

    #[test]
    fn broadcast_join_over_temporary(a in cells(), b in cells()) {
        let root = Node::join(Node::map(Node::Symbol(0), UnaryOp::Neg), Node::Symbol(1), BinaryOp::Sub);
        check(root, &[fill("tensor(x[2],y[3])", &[], &a), fill("tensor(x[2])", &[], &b)])?;
    }

    #[test]
    fn number_join_chain(a in cells(), n in -3.0f64..3.0) {
        let root = Node::join(
            Node::Number(n),
            Node::map(Node::join(Node::Symbol(0), Node::Number(2.0), BinaryOp::Mul), UnaryOp::Tanh),
            BinaryOp::Add,
        );
        check(root, &[fill("tensor(x[3],y[2])", &[], &a)])?;
    }

    // ─── Sparse and mixed ───

    #[test]
    fn mixed_inner_product(a in cells(), b in cells(), l in labels()) {
        let root = Node::reduce(mul_join(), Aggr::Sum, &["y"]);
        check(root, &[fill("tensor(k{},x[2],y[2])", &l, &a), fill("tensor(y[2])", &[], &b)])?;
    }

    #[test]
    fn sparse_times_mixed(a in cells(), b in cells(), l in labels(), r in labels()) {
        check(mul_join(), &[fill("tensor(k{})", &l, &a), fill("tensor(k{},x[2])", &r, &b)])?;
    }

    #[test]
    fn sparse_merge(a in cells(), b in cells(), l in labels(), r in labels()) {
        let root = Node::merge(Node::Symbol(0), Node::Symbol(1), BinaryOp::Max);
        check(root, &[fill("tensor(k{})", &l, &a), fill("tensor(k{})", &r, &b)])?;
    }

    #[test]
    fn reduce_over_mapped(a in cells(), l in labels()) {
        check(Node::reduce(Node::Symbol(0), Aggr::Max, &["k"]), &[fill("tensor(k{},x[2])", &l, &a)])?;
        check(Node::reduce(Node::Symbol(0), Aggr::Avg, &[]), &[fill("tensor(k{},x[2])", &l, &a)])?;
    }

    #[test]
    fn rename_reorders(a in cells(), l in labels()) {
        let root = Node::rename(Node::Symbol(0), &["k", "x"], &["z", "a"]);
        check(root, &[fill("tensor(k{},x[3])", &l, &a)])?;
    }

    // ─── Special values ───

    #[test]
    fn trivial_reduce_with_special_values(a in special_cells()) {
        for aggr in [Aggr::Max, Aggr::Min, Aggr::Sum, Aggr::Avg, Aggr::Prod, Aggr::Median, Aggr::Count] {
            check(Node::reduce(Node::Symbol(0), aggr, &["x"]), &[fill("tensor(x[1],y[3])", &[], &a)])?;
            check(Node::reduce(Node::Symbol(0), aggr, &[]), &[fill("tensor(x[1])", &[], &a)])?;
        }
    }

    #[test]
    fn dot_product_with_special_values(a in special_cells(), b in cells()) {
        let root = Node::reduce(mul_join(), Aggr::Sum, &[]);
        check(root, &[fill("tensor(x[5])", &[], &a), fill("tensor<float>(x[5])", &[], &b)])?;
    }

    #[test]
    fn matrix_product_with_special_values(a in special_cells(), b in special_cells()) {
        let root = Node::reduce(mul_join(), Aggr::Sum, &["k"]);
        check(root, &[fill("tensor(a[2],k[3])", &[], &a), fill("tensor(k[3],z[2])", &[], &b)])?;
    }

    #[test]
    fn number_join_with_special_values(a in special_cells(), n in prop::sample::select(vec![f64::NAN, f64::INFINITY, 0.5])) {
        let root = Node::join(Node::map(Node::Symbol(0), UnaryOp::Neg), Node::Number(n), BinaryOp::Mul);
        check(root, &[fill("tensor(x[3],y[2])", &[], &a)])?;
        let root = Node::join(Node::Number(2.0), Node::Symbol(0), BinaryOp::Sub);
        check(root, &[fill("tensor<float>(x[3])", &[], &a)])?;
    }

    #[test]
    fn concat_along_shared_dim(a in cells(), b in cells()) {
        let root = Node::concat(Node::Symbol(0), Node::Symbol(1), "x");
        check(root, &[fill("tensor(x[2],y[2])", &[], &a), fill("tensor(x[3],y[2])", &[], &b)])?;
    }
}
