mod dir_planner;

pub use dir_planner::DirRemodelPlanner;
