use cohort::transport::local::LocalWorld;
use cohort::{Communicator, Mat};

#[test]
fn matrix_send_recv_between_models() {
    LocalWorld::run(2, |t| {
        // Two models of one rank each.
        let comm = Communicator::new(t, 1).unwrap();
        let mut m = Mat::zeros(2, 2);
        if comm.model_rank() == 0 {
            m.fill(3.0);
            comm.send(&m, 1, 0).unwrap();
            assert_eq!(comm.bytes_sent(), 16);
        } else {
            comm.recv(&mut m, 0, 0).unwrap();
            assert_eq!(m.get(1, 1), 3.0);
            assert_eq!(comm.bytes_received(), 16);
        }
    });
}

#[test]
fn nonblocking_recv_completes_on_wait() {
    LocalWorld::run(2, |t| {
        let comm = Communicator::new(t, 1).unwrap();
        if comm.model_rank() == 0 {
            let mut m = Mat::zeros(1, 3);
            m.set(0, 0, 1.0);
            m.set(0, 2, 9.0);
            let req = comm.nb_send(&m, 1, 0).unwrap();
            comm.wait(req, &mut m).unwrap();
        } else {
            let req = comm.nb_recv(0, 0);
            let mut m = Mat::zeros(1, 3);
            comm.wait(req, &mut m).unwrap();
            assert_eq!(m.get(0, 0), 1.0);
            assert_eq!(m.get(0, 2), 9.0);
        }
    });
}

#[test]
fn broadcast_reaches_listed_destinations_only() {
    LocalWorld::run(3, |t| {
        let comm = Communicator::new(t, 3).unwrap();
        let mut m = Mat::zeros(1, 2);
        if comm.world_rank() == 0 {
            m.fill(4.0);
        }
        comm.broadcast(&mut m, &[1], 0).unwrap();
        match comm.world_rank() {
            0 | 1 => assert_eq!(m.get(0, 0), 4.0),
            _ => assert_eq!(m.get(0, 0), 0.0),
        }
    });
}

#[test]
fn intermodel_broadcast_replicates_root_model() {
    LocalWorld::run(4, |t| {
        // Two models of two ranks; broadcast model 0's copy.
        let comm = Communicator::new(t, 2).unwrap();
        let mut m = Mat::zeros(2, 2);
        if comm.model_rank() == 0 {
            m.fill(7.0);
        }
        comm.intermodel_broadcast_matrix(&mut m, 0).unwrap();
        assert_eq!(m.get(0, 0), 7.0);
        assert_eq!(m.get(1, 1), 7.0);
    });
}

#[test]
fn intermodel_sum_adds_replica_copies() {
    LocalWorld::run(4, |t| {
        let comm = Communicator::new(t, 2).unwrap();
        let mut m = Mat::zeros(2, 3);
        m.fill((comm.model_rank() + 1) as f32);
        comm.intermodel_sum_matrix(&mut m).unwrap();
        // Models hold 1s and 2s; both end with 3s.
        for r in 0..2 {
            for c in 0..3 {
                assert_eq!(m.get(r, c), 3.0);
            }
        }
        assert_eq!(comm.bytes_sent(), 24);
        assert_eq!(comm.bytes_received(), 24);
    });
}
