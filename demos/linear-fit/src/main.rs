flint_runner::script_main!(linear_fit::build_task());
