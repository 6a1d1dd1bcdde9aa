pub mod simulated_worker;
