//! # conveyor-scheduler
//!
//! 后台周期任务：把到期的定时/重试任务迁回队列的轮询器，
//! 以及把已死进程暂存的任务放回队列的孤儿回收器。

pub mod orphan_reaper;
pub mod poller;

pub use orphan_reaper::OrphanReaper;
pub use poller::{jittered, Poller};
