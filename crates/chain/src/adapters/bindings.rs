//! Solidity interfaces of the lending contracts.
//!
//! Only the functions the reconciliation engine calls are declared.

use alloy::sol;

sol! {
    /// Supply-side pool.
    #[sol(rpc)]
    #[derive(Debug)]
    interface ILendingPool {
        function deposit(uint256 amount) external;
        function withdraw(uint256 amount) external;
        function getLendingToken(address user) external view returns (uint256);
        function lendingBalance(address user) external view returns (uint256);
        function totalLending() external view returns (uint256);
        function annualInterestRate() external view returns (uint256);
        function underlying() external view returns (address);
    }

    /// Borrowing contract.
    #[sol(rpc)]
    #[derive(Debug)]
    interface IBorrowing {
        function borrow(uint256 amount) external;
        function repay(uint256 amount) external;
        function getBorrowToken(address user) external view returns (uint256);
        function borrowedPrincipal(address user) external view returns (uint256);
        function totalBorrowed() external view returns (uint256);
        function getCurrentRate() external view returns (uint256);
        function token() external view returns (address);
    }

    /// Collateral manager.
    #[sol(rpc)]
    #[derive(Debug)]
    interface ICollateral {
        function depositCollateral(uint256 amount) external;
        function withdrawCollateral(uint256 amount) external;
        function liquidate(address borrower, uint256 repayAmount) external;
        function collateralBalance(address user) external view returns (uint256);
        function getCollateralRatio(address user) external view returns (uint256);
        function getMaxBorrowableAmount(address user) external view returns (uint256);
        function MIN_COLLATERAL_RATIO() external view returns (uint256);
        function LIQUIDATION_THRESHOLD() external view returns (uint256);
        function LIQUIDATION_BONUS() external view returns (uint256);
        function token() external view returns (address);
    }
}
