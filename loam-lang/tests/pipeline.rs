//! End-to-end checks of the whole pipeline: observable behavior is
//! preserved, free variables never grow, and the single passes are
//! idempotent up to alpha-equivalence.

use loam_lang::interner::{Ident, LamNodeId};
use loam_lang::lambda::builder::ident;
use loam_lang::lambda::eval::{eval_program, value_eq, Value};
use loam_lang::lambda::traverse::{alpha_eq, free_variables};
use loam_lang::lambda::{FunctionAttrs, Prim};
use loam_lang::passes::tail_infos::CallAnnotations;
use loam_lang::passes::{exits, lets};
use loam_lang::warnings::Warnings;
use loam_lang::{app, block, catch, field, func, ifthen, int, let_, letrec, prim, raise_, seq, var};
use loam_lang::{optimize, Config};

fn run_pipeline(config: &Config, lam: LamNodeId) -> LamNodeId {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut warnings = Warnings::new();
    let mut annotations = CallAnnotations::new();
    optimize(config, &mut warnings, &mut annotations, lam).expect("pipeline failed")
}

fn native_config() -> Config {
    Config {
        native_code: true,
        ..Default::default()
    }
}

/// `[1; 2; 3]` as cons cells of tag 0, nil = 0.
fn int_list(items: &[i64]) -> LamNodeId {
    items
        .iter()
        .rev()
        .fold(int!(0), |acc, n| block!(0, vec![int!(*n), acc]))
}

/// The classic map with a TMC annotation.
fn map_program(list: LamNodeId) -> LamNodeId {
    let map = ident("map");
    let f = ident("f");
    let l = ident("l");
    let x = ident("x");
    let body = ifthen!(
        var!(l),
        block!(
            0,
            vec![
                app!(var!(f), vec![field!(0, var!(l))]),
                app!(var!(map), vec![var!(f), field!(1, var!(l))])
            ]
        ),
        int!(0)
    );
    let attrs = FunctionAttrs {
        tmc_candidate: true,
        ..Default::default()
    };
    letrec!(
        vec![(map, func!(vec![f, l], body, attrs))],
        app!(
            var!(map),
            vec![
                func!(vec![x], prim!(Prim::Addint, vec![var!(x), int!(1)])),
                list
            ]
        )
    )
}

#[test]
fn tmc_preserves_map_semantics() {
    let before = map_program(int_list(&[1, 2, 3, 4]));
    let expected = eval_program(before).unwrap();

    let after = run_pipeline(&native_config(), map_program(int_list(&[1, 2, 3, 4])));
    let actual = eval_program(after).unwrap();
    assert!(value_eq(&expected, &actual));

    // Sanity: the successor list really is [2; 3; 4; 5].
    let direct = eval_program(int_list(&[2, 3, 4, 5])).unwrap();
    assert!(value_eq(&actual, &direct));
}

#[test]
fn local_function_promotion_preserves_semantics() {
    fn program() -> LamNodeId {
        let g = ident("g");
        let x = ident("x");
        let input = let_!(
            g,
            func!(vec![x], prim!(Prim::Mulint, vec![var!(x), int!(10)])),
            ifthen!(
                int!(1),
                app!(var!(g), vec![int!(3)]),
                app!(var!(g), vec![int!(4)])
            )
        );
        input
    }
    let expected = eval_program(program()).unwrap();
    let optimized = run_pipeline(&native_config(), program());
    let actual = eval_program(optimized).unwrap();
    assert!(value_eq(&expected, &actual));
    assert!(value_eq(&actual, &Value::Int(30)));
}

#[test]
fn promoted_function_leaves_no_catch_when_single_use() {
    // With a single call site the promotion's catch is then contracted by
    // exit simplification, leaving a plain let cascade.
    let g = ident("g");
    let x = ident("x");
    let input = let_!(
        g,
        func!(vec![x], prim!(Prim::Addint, vec![var!(x), int!(1)])),
        app!(var!(g), vec![int!(5)])
    );
    let output = run_pipeline(&native_config(), input);
    let expected = eval_program(output).unwrap();
    assert!(value_eq(&expected, &Value::Int(6)));
    fn count_catches(lam: LamNodeId) -> usize {
        let mut n = usize::from(matches!(
            lam.to_lam(),
            loam_lang::lambda::Lam::Staticcatch(..)
        ));
        for (child, _) in loam_lang::lambda::traverse::tail_classified_children(lam) {
            n += count_catches(child);
        }
        n
    }
    assert_eq!(count_catches(output), 0);
}

#[test]
fn ref_promotion_preserves_semantics() {
    use loam_lang::lambda::{AssignMode, Mutability, ValueKind};
    fn counter_program() -> LamNodeId {
        let r = ident("r");
        let refcell = prim!(
            Prim::Makeblock(0, Mutability::Mutable, Some(vec![ValueKind::Int])),
            vec![int!(0)]
        );
        let_!(
            r,
            refcell,
            seq!(
                prim!(
                    Prim::Setfield(0, AssignMode::HeapInit),
                    vec![
                        var!(r),
                        prim!(Prim::Offsetint(5), vec![field!(0, var!(r))])
                    ]
                ),
                seq!(
                    prim!(Prim::Offsetref(2), vec![var!(r)]),
                    field!(0, var!(r))
                )
            )
        )
    }
    let expected = eval_program(counter_program()).unwrap();
    assert!(value_eq(&expected, &Value::Int(7)));
    let optimized = run_pipeline(&native_config(), counter_program());
    let actual = eval_program(optimized).unwrap();
    assert!(value_eq(&expected, &actual));
}

#[test]
fn exit_simplification_preserves_semantics() {
    fn program() -> LamNodeId {
        let a = ident("a");
        catch!(
            ifthen!(int!(0), int!(100), raise_!(9, vec![int!(41)])),
            9,
            vec![a],
            prim!(Prim::Addint, vec![var!(a), int!(1)])
        )
    }
    let expected = eval_program(program()).unwrap();
    let optimized = run_pipeline(&native_config(), program());
    let actual = eval_program(optimized).unwrap();
    assert!(value_eq(&expected, &actual));
    assert!(value_eq(&actual, &Value::Int(42)));
}

#[test]
fn free_variables_never_grow() {
    let g = ident("g");
    let h = ident("h");
    let v = ident("v");
    // g and h stay free through the pipeline.
    let input = let_!(
        v,
        app!(var!(g), vec![int!(1)]),
        seq!(app!(var!(h), vec![var!(v)]), var!(v))
    );
    let before = free_variables(input);
    let output = run_pipeline(&native_config(), input);
    let after = free_variables(output);
    assert!(after.is_subset(&before));
}

#[test]
fn exit_simplification_is_idempotent() {
    let a = ident("a");
    let c = ident("c");
    let input = catch!(
        ifthen!(var!(c), raise_!(5, vec![int!(1)]), raise_!(5, vec![int!(2)])),
        5,
        vec![a],
        var!(a)
    );
    let once = exits::simplify(true, input);
    let twice = exits::simplify(true, once);
    assert!(alpha_eq(once, twice));
}

#[test]
fn let_simplification_is_idempotent() {
    let v = ident("v");
    let w = ident("w");
    let input = let_!(
        w,
        block!(0, vec![int!(1)]),
        let_!(
            loam_lang::lambda::LetKind::Alias,
            loam_lang::lambda::ValueKind::Generic,
            v,
            var!(w),
            seq!(field!(0, var!(v)), field!(0, var!(w)))
        )
    );
    let once = lets::simplify(true, input);
    let twice = lets::simplify(true, once);
    assert!(alpha_eq(once, twice));
}

#[test]
fn debug_bytecode_config_disables_rewrites() {
    let config = Config {
        native_code: false,
        debug: true,
        ..Default::default()
    };
    let v = ident("v");
    // A single-use alias would be inlined under optimize.
    let input = let_!(
        loam_lang::lambda::LetKind::Alias,
        loam_lang::lambda::ValueKind::Generic,
        v,
        block!(0, vec![int!(1)]),
        field!(0, var!(v))
    );
    let output = run_pipeline(&config, input);
    assert!(matches!(
        output.to_lam(),
        loam_lang::lambda::Lam::Let(loam_lang::lambda::LetKind::Alias, ..)
    ));
}

#[test]
fn annotations_record_call_sites() {
    let config = Config {
        native_code: true,
        annotations: true,
        ..Default::default()
    };
    let f = ident("f");
    let input = app!(var!(f), vec![int!(1)]);
    let mut warnings = Warnings::new();
    let mut annotations = CallAnnotations::new();
    optimize(&config, &mut warnings, &mut annotations, input).unwrap();
    assert_eq!(annotations.iter().count(), 1);
}

#[test]
fn beta_curry_cascade_matches_reference() {
    let x = ident("x");
    let y = ident("y");
    let z = ident("z");
    fn add(a: LamNodeId, b: LamNodeId) -> LamNodeId {
        prim!(Prim::Addint, vec![a, b])
    }
    let program = |x: Ident, y: Ident, z: Ident| {
        app!(
            func!(vec![x, y], func!(vec![z], add(add(var!(x), var!(y)), var!(z)))),
            vec![int!(1), int!(2), int!(3)]
        )
    };
    let expected = eval_program(program(x, y, z)).unwrap();
    let optimized = run_pipeline(&native_config(), program(x, y, z));
    let actual = eval_program(optimized).unwrap();
    assert!(value_eq(&expected, &actual));
    assert!(value_eq(&actual, &Value::Int(6)));
}
