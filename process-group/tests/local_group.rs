use anyhow::Result;
use approx::assert_abs_diff_eq;
use indexmap::IndexMap;
use process_group::{all_gather, all_reduce_sum, reduce_dict, LocalGroup, ProcessGroup};
use std::thread;

#[test]
fn all_reduce_over_threads() -> Result<()> {
    let members = LocalGroup::new(3)?;

    let results: Vec<Vec<f64>> = thread::scope(|scope| {
        let handles: Vec<_> = members
            .iter()
            .map(|member| {
                scope.spawn(move || {
                    let rank = member.rank() as f64;
                    all_reduce_sum(member, &[rank, 1.0]).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for sum in results {
        assert_eq!(sum, vec![3.0, 3.0]);
    }
    Ok(())
}

#[test]
fn consecutive_gathers_keep_rounds_apart() -> Result<()> {
    let members = LocalGroup::new(2)?;

    let results: Vec<Vec<Vec<usize>>> = thread::scope(|scope| {
        let handles: Vec<_> = members
            .iter()
            .map(|member| {
                scope.spawn(move || {
                    (0..5)
                        .map(|round| all_gather(member, &(round * 10 + member.rank())).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for rounds in results {
        for (round, gathered) in rounds.into_iter().enumerate() {
            assert_eq!(gathered, vec![round * 10, round * 10 + 1]);
        }
    }
    Ok(())
}

#[test]
fn reduce_dict_averages_and_keeps_order() -> Result<()> {
    let members = LocalGroup::new(2)?;

    let results: Vec<IndexMap<String, f64>> = thread::scope(|scope| {
        let handles: Vec<_> = members
            .iter()
            .map(|member| {
                scope.spawn(move || {
                    let scale = (member.rank() + 1) as f64;
                    let dict: IndexMap<String, f64> = [
                        ("loss_ce".to_string(), 1.0 * scale),
                        ("loss_bbox".to_string(), 2.0 * scale),
                    ]
                    .into_iter()
                    .collect();
                    reduce_dict(member, &dict).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for reduced in results {
        assert_eq!(
            reduced.keys().collect::<Vec<_>>(),
            vec!["loss_ce", "loss_bbox"]
        );
        assert_abs_diff_eq!(reduced["loss_ce"], 1.5);
        assert_abs_diff_eq!(reduced["loss_bbox"], 3.0);
    }
    Ok(())
}

#[test]
fn non_finite_values_reach_every_worker() -> Result<()> {
    let members = LocalGroup::new(2)?;

    let results: Vec<IndexMap<String, f64>> = thread::scope(|scope| {
        let handles: Vec<_> = members
            .iter()
            .map(|member| {
                scope.spawn(move || {
                    let (loss_ce, loss_bbox) = match member.rank() {
                        0 => (f64::NAN, 1.0),
                        _ => (1.0, f64::INFINITY),
                    };
                    let dict: IndexMap<String, f64> = [
                        ("loss_ce".to_string(), loss_ce),
                        ("loss_bbox".to_string(), loss_bbox),
                    ]
                    .into_iter()
                    .collect();
                    reduce_dict(member, &dict).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for reduced in results {
        assert!(reduced["loss_ce"].is_nan());
        assert_eq!(reduced["loss_bbox"], f64::INFINITY);
    }
    Ok(())
}
