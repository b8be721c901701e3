/// Assert at compile time that a boolean expression evaluates to true.
#[macro_export]
macro_rules! const_assert {
    ($x:expr $(,)?) => {
        #[allow(clippy::const_is_empty, clippy::eq_op, unknown_lints)]
        const _: [(); 0 - !{
            const CONST_ASSERT: bool = $x;
            CONST_ASSERT
        } as usize] = [];
    };
}
